use std::collections::{HashMap, HashSet};

use tracing::{debug, trace};

use crate::{
    ast::{self, ItemKind, Path, TranslationUnit, TypeExpr},
    config::Config,
    diagnostic::{Diagnostic, DiagnosticKind, ExtractError},
    model::{
        qualify, split_scope, BaseSpec, ConstantDecl, Decl, DeclarationModel, EnumDecl, Field,
        FunctionDecl, Instantiation, Item, NamedKind, Origin, Parameter, Parsed, Primitive,
        RecordDecl, RecordKind, ScopeKind, Signature, SpecializationDecl, TemplateDecl,
        TemplateParam, TemplateParamKind, TypeArg, TypeRef, TypedefDecl, VariableDecl,
    },
    preprocess::MacroConstant,
};

type Result<T, E = ExtractError> = std::result::Result<T, E>;

/// Library type names which resolve with no declaration.
static WELL_KNOWN: phf::Set<&'static str> = phf::phf_set! {
    "size_t",
    "ssize_t",
    "ptrdiff_t",
    "intptr_t",
    "uintptr_t",
    "intmax_t",
    "uintmax_t",
    "int8_t",
    "int16_t",
    "int32_t",
    "int64_t",
    "uint8_t",
    "uint16_t",
    "uint32_t",
    "uint64_t",
    "wchar_t",
    "char8_t",
    "char16_t",
    "char32_t",
    "off_t",
    "time_t",
    "FILE",
    "va_list",
    "__builtin_va_list",
    "nullptr_t",
    "std::nullptr_t",
    "std::size_t",
    "std::ptrdiff_t",
    "std::string",
    "std::wstring",
};

/// Resolves the declarations of a parsed file into its declaration model.
///
/// Every type name must resolve to a declaration of the file (or of what it
/// includes), to a template parameter or to a well-known library type.
/// Otherwise the whole file fails with [`ExtractError::UnresolvedType`].
/// Diagnostics reported before such a failure still go to `diagnostics`.
pub fn resolve(
    unit: &TranslationUnit,
    constants: &[MacroConstant<'_>],
    config: &Config,
    diagnostics: &mut Vec<Diagnostic>,
) -> Result<DeclarationModel> {
    let mut resolver = Resolver::new(config);
    let global = Cx::default();
    resolver.register_items(&unit.items, &global);
    resolver.link_specializations();

    for constant in constants {
        let item = Item {
            decl: Decl::Constant(ConstantDecl {
                name: constant.name.clone(),
                value: constant.value.clone(),
            }),
            origin: constant.loc.into(),
        };
        resolver
            .model
            .insert_reporting(DeclarationModel::GLOBAL, item, &mut resolver.diagnostics);
    }
    let resolved = resolver.resolve_items(&unit.items, &global);
    diagnostics.append(&mut resolver.diagnostics);
    resolved?;

    debug!(
        names = resolver.names.len(),
        decls = resolver.model.len(),
        "resolved"
    );
    Ok(resolver.model)
}

/// Where a name is being resolved: a scope, plus the template parameters in
/// effect.
#[derive(Clone, Debug, Default)]
struct Cx {
    scope: String,
    params: Vec<String>,
}

impl Cx {
    fn enter(&self, name: &str) -> Cx {
        Cx {
            scope: qualify(&self.scope, name),
            params: self.params.clone(),
        }
    }

    fn with_params(&self, params: &[TemplateParam<Parsed>]) -> Cx {
        let mut cx = self.clone();
        cx.params.extend(params.iter().filter_map(|p| p.name.clone()));
        cx
    }
}

/// A type name, as registered by the first pass.
#[derive(Clone, Debug)]
enum Entry {
    Record(RecordKind),
    Enum,
    Typedef { target: TypeExpr, cx: Cx },
    Template {
        kind: RecordKind,
        params: Vec<TemplateParam<Parsed>>,
        cx: Cx,
    },
}

impl Entry {
    fn matches(&self, kind: Option<NamedKind>) -> bool {
        match (self, kind) {
            (_, None) => true,
            (Entry::Enum, Some(NamedKind::Enum)) => true,
            (Entry::Record(_) | Entry::Template { .. }, Some(kind)) => kind != NamedKind::Enum,
            _ => false,
        }
    }
}

/// A specialization, as a pattern instantiations are matched against.
struct Pattern {
    params: Vec<String>,
    args: Vec<ast::TypeArg>,
    cx: Cx,
    state: PatternState,
}

#[derive(Clone)]
enum PatternState {
    Pending,
    InProgress,
    Resolved {
        /// The arguments as written.
        written: Vec<TypeArg>,
        /// The arguments with the primary template's defaults.
        filled: Vec<TypeArg>,
    },
}

struct PendingSpecialization {
    template: String,
    kind: RecordKind,
    params: Vec<TemplateParam<Parsed>>,
    args: Vec<ast::TypeArg>,
    cx: Cx,
}

struct Resolver<'cfg> {
    config: &'cfg Config,
    model: DeclarationModel,
    diagnostics: Vec<Diagnostic>,
    names: HashMap<String, Vec<Entry>>,
    record_scopes: HashSet<String>,
    pending: Vec<PendingSpecialization>,
    /// Specializations by the qualified name of their primary template.
    specializations: HashMap<String, Vec<Pattern>>,
    /// Templates which are only known from their specializations.
    orphans: HashSet<String>,
    /// Terminal targets of the typedefs resolved so far.
    terminals: HashMap<String, TypeRef>,
    /// Lengths of the typedef chains resolved so far.
    chains: HashMap<String, usize>,
    /// The typedef chain being resolved.
    resolving: Vec<String>,
    /// Origin of the declaration being resolved, for errors.
    origin: Origin,
}

/// First pass.
impl Resolver<'_> {
    fn register_items(&mut self, items: &[ast::Item], cx: &Cx) {
        for item in items {
            match &item.kind {
                ItemKind::Namespace {
                    name: Some(name),
                    items,
                } => self.register_items(items, &cx.enter(name)),
                ItemKind::Namespace { name: None, items } => self.register_items(items, cx),
                ItemKind::Decl { decl, nested } => {
                    self.register_decl(decl, cx);
                    match member_scope(decl, cx) {
                        Some(inner) => {
                            self.record_scopes.insert(inner.scope.clone());
                            self.register_items(nested, &inner);
                        }
                        None => self.register_items(nested, cx),
                    }
                }
            }
        }
    }

    fn register_decl(&mut self, decl: &Decl<Parsed>, cx: &Cx) {
        let (name, entry) = match decl {
            Decl::Record(RecordDecl {
                name: Some(name),
                kind,
                ..
            }) => (name, Entry::Record(*kind)),
            Decl::Enum(EnumDecl {
                name: Some(name), ..
            }) => (name, Entry::Enum),
            Decl::Typedef(t) => (
                &t.name,
                Entry::Typedef {
                    target: t.ty.clone(),
                    cx: cx.clone(),
                },
            ),
            Decl::Template(TemplateDecl { params, record }) => {
                let Some(name) = &record.name else { return };
                let entry = Entry::Template {
                    kind: record.kind,
                    params: params.clone(),
                    cx: cx.clone(),
                };
                (name, entry)
            }
            Decl::Specialization(s) => {
                self.pending.push(PendingSpecialization {
                    template: s.template.clone(),
                    kind: s.record.kind,
                    params: s.params.clone(),
                    args: s.args.clone(),
                    cx: cx.with_params(&s.params),
                });
                return;
            }
            _ => return,
        };
        let qualified = qualify(&cx.scope, name);
        trace!(name = qualified.as_str(), "registered");
        self.names.entry(qualified).or_default().push(entry);
    }

    /// Binds every specialization to its primary template, which becomes
    /// known once all names are registered.
    fn link_specializations(&mut self) {
        for pending in std::mem::take(&mut self.pending) {
            let primary = match self.find_primary(&pending.template, &pending.cx.scope) {
                Some(primary) => primary,
                None => {
                    let primary = qualify(&pending.cx.scope, &pending.template);
                    self.orphans.insert(primary.clone());
                    let entry = Entry::Template {
                        kind: pending.kind,
                        params: Vec::new(),
                        cx: pending.cx.clone(),
                    };
                    self.names.entry(primary.clone()).or_default().push(entry);
                    primary
                }
            };
            let pattern = Pattern {
                params: pending.params.iter().filter_map(|p| p.name.clone()).collect(),
                args: pending.args,
                cx: pending.cx,
                state: PatternState::Pending,
            };
            self.specializations.entry(primary).or_default().push(pattern);
        }
    }

    fn find_primary(&self, template: &str, scope: &str) -> Option<String> {
        prefixes(scope)
            .map(|prefix| qualify(prefix, template))
            .find(|qualified| {
                self.names
                    .get(qualified)
                    .is_some_and(|entries| entries.iter().any(|e| matches!(e, Entry::Template { .. })))
            })
    }
}

/// Second pass.
impl<'cfg> Resolver<'cfg> {
    fn new(config: &'cfg Config) -> Self {
        Resolver {
            config,
            model: DeclarationModel::new(),
            diagnostics: Vec::new(),
            names: HashMap::new(),
            record_scopes: HashSet::new(),
            pending: Vec::new(),
            specializations: HashMap::new(),
            orphans: HashSet::new(),
            terminals: HashMap::new(),
            chains: HashMap::new(),
            resolving: Vec::new(),
            origin: Origin::default(),
        }
    }

    fn resolve_items(&mut self, items: &[ast::Item], cx: &Cx) -> Result<()> {
        for item in items {
            match &item.kind {
                ItemKind::Namespace {
                    name: Some(name),
                    items,
                } => {
                    let inner = cx.enter(name);
                    self.model.scope_or_insert(&inner.scope, ScopeKind::Namespace);
                    self.resolve_items(items, &inner)?;
                }
                ItemKind::Namespace { name: None, items } => self.resolve_items(items, cx)?,
                ItemKind::Decl { decl, nested } => {
                    self.origin = item.origin.clone();
                    let resolved = self.resolve_decl(decl, cx)?;
                    let scope = self.model.scope_or_insert(&cx.scope, ScopeKind::Namespace);
                    let item = Item {
                        decl: resolved,
                        origin: self.origin.clone(),
                    };
                    self.model.insert_reporting(scope, item, &mut self.diagnostics);

                    if !nested.is_empty() {
                        let inner = match member_scope(decl, cx) {
                            Some(inner) => {
                                self.model.scope_or_insert(&inner.scope, ScopeKind::Record);
                                inner
                            }
                            None => cx.clone(),
                        };
                        self.resolve_items(nested, &inner)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn resolve_decl(&mut self, decl: &Decl<Parsed>, cx: &Cx) -> Result<Decl> {
        let decl = match decl {
            Decl::Record(r) => {
                let inner = member_scope(decl, cx).unwrap_or_else(|| cx.clone());
                Decl::Record(self.resolve_record(r, &inner)?)
            }
            Decl::Enum(e) => Decl::Enum(self.resolve_enum(e, cx)?),
            Decl::Typedef(t) => {
                let qualified = qualify(&cx.scope, &t.name);
                Decl::Typedef(TypedefDecl {
                    name: t.name.clone(),
                    ty: self.resolve_typedef(&qualified, &t.ty, cx)?,
                })
            }
            Decl::Function(f) => Decl::Function(self.resolve_function(f, cx)?),
            Decl::Variable(v) => Decl::Variable(VariableDecl {
                name: v.name.clone(),
                ty: self.resolve_type(&v.ty, cx)?,
                is_extern: v.is_extern,
                is_static: v.is_static,
            }),
            Decl::Constant(c) => Decl::Constant(c.clone()),
            Decl::Template(t) => {
                let inner = member_scope(decl, cx).unwrap_or_else(|| cx.with_params(&t.params));
                Decl::Template(TemplateDecl {
                    params: self.resolve_params(&t.params, &cx.with_params(&t.params))?,
                    record: self.resolve_record(&t.record, &inner)?,
                })
            }
            Decl::Specialization(s) => {
                let inner = member_scope(decl, cx).unwrap_or_else(|| cx.with_params(&s.params));
                let outer = cx.with_params(&s.params);
                let template = self
                    .find_primary(&s.template, &cx.scope)
                    .unwrap_or_else(|| qualify(&cx.scope, &s.template));
                let orphaned = self.orphans.contains(&template);
                if orphaned {
                    self.diagnostics.push(Diagnostic::at(
                        DiagnosticKind::OrphanedSpecialization,
                        self.origin.file.clone(),
                        self.origin.position(),
                        format!("specialization of unknown template `{template}`"),
                    ));
                }
                Decl::Specialization(SpecializationDecl {
                    template,
                    params: self.resolve_params(&s.params, &outer)?,
                    args: self.resolve_args(&s.args, &outer)?,
                    record: self.resolve_record(&s.record, &inner)?,
                    orphaned,
                })
            }
        };
        Ok(decl)
    }

    /// Resolves a record, whose members are looked up from `cx`.
    fn resolve_record(&mut self, r: &RecordDecl<Parsed>, cx: &Cx) -> Result<RecordDecl> {
        let fields = r
            .fields
            .iter()
            .map(|field| {
                Ok(Field {
                    name: field.name.clone(),
                    ty: self.resolve_type(&field.ty, cx)?,
                    bit_width: field.bit_width.clone(),
                    access: field.access,
                    ordinal: field.ordinal,
                    is_static: field.is_static,
                })
            })
            .collect::<Result<_>>()?;
        let methods = r
            .methods
            .iter()
            .map(|method| self.resolve_function(method, cx))
            .collect::<Result<_>>()?;
        let bases = r
            .bases
            .iter()
            .map(|base| {
                let name = match self.lookup(&base.name, None, cx)? {
                    TypeRef::Named { name, .. } => name,
                    other => other.to_string(),
                };
                Ok(BaseSpec {
                    name,
                    access: base.access,
                    is_virtual: base.is_virtual,
                })
            })
            .collect::<Result<_>>()?;
        Ok(RecordDecl {
            name: r.name.clone(),
            kind: r.kind,
            fields,
            methods,
            bases,
            complete: r.complete,
            typedef_name: r.typedef_name,
        })
    }

    fn resolve_enum(&mut self, e: &EnumDecl<Parsed>, cx: &Cx) -> Result<EnumDecl> {
        Ok(EnumDecl {
            name: e.name.clone(),
            scoped: e.scoped,
            underlying: self.resolve_type(&e.underlying, cx)?,
            members: e.members.clone(),
            complete: e.complete,
            typedef_name: e.typedef_name,
        })
    }

    fn resolve_function(&mut self, f: &FunctionDecl<Parsed>, cx: &Cx) -> Result<FunctionDecl> {
        let cx = cx.with_params(&f.template_params);
        Ok(FunctionDecl {
            name: f.name.clone(),
            kind: f.kind,
            signature: self.resolve_signature(&f.signature, &cx)?,
            qualifiers: f.qualifiers,
            access: f.access,
            template_params: self.resolve_params(&f.template_params, &cx)?,
            scope: cx.scope.clone(),
        })
    }

    fn resolve_signature(&mut self, sig: &Signature<Parsed>, cx: &Cx) -> Result<Signature> {
        let params = sig
            .params
            .iter()
            .map(|param| {
                Ok(Parameter {
                    name: param.name.clone(),
                    ty: self.resolve_type(&param.ty, cx)?,
                    has_default: param.has_default,
                })
            })
            .collect::<Result<_>>()?;
        Ok(Signature {
            return_ty: self.resolve_type(&sig.return_ty, cx)?,
            params,
            variadic: sig.variadic,
        })
    }

    fn resolve_params(
        &mut self,
        params: &[TemplateParam<Parsed>],
        cx: &Cx,
    ) -> Result<Vec<TemplateParam>> {
        params
            .iter()
            .map(|param| {
                let kind = match &param.kind {
                    TemplateParamKind::Type { default } => TemplateParamKind::Type {
                        default: default
                            .as_ref()
                            .map(|ty| self.resolve_type(ty, cx))
                            .transpose()?,
                    },
                    TemplateParamKind::NonType { ty, default } => TemplateParamKind::NonType {
                        ty: self.resolve_type(ty, cx)?,
                        default: default.clone(),
                    },
                    TemplateParamKind::Template { default } => TemplateParamKind::Template {
                        default: default.clone(),
                    },
                };
                Ok(TemplateParam {
                    name: param.name.clone(),
                    kind,
                    pack: param.pack,
                })
            })
            .collect()
    }

    fn resolve_args(&mut self, args: &[ast::TypeArg], cx: &Cx) -> Result<Vec<TypeArg>> {
        args.iter()
            .map(|arg| match arg {
                ast::TypeArg::Type(ty) => Ok(TypeArg::Type(self.resolve_type(ty, cx)?)),
                ast::TypeArg::Literal(literal) => Ok(TypeArg::Literal(literal.clone())),
            })
            .collect()
    }

    fn resolve_type(&mut self, ty: &TypeExpr, cx: &Cx) -> Result<TypeRef> {
        let ty = match ty {
            TypeExpr::Primitive(p) => TypeRef::Primitive(*p),
            TypeExpr::Path(path) => self.lookup(path, None, cx)?,
            TypeExpr::Elaborated(kind, path) => self.lookup(path, Some(*kind), cx)?,
            TypeExpr::Dependent(path) => TypeRef::Dependent(path.to_string()),
            TypeExpr::Pointer(inner) => match self.resolve_type(inner, cx)? {
                TypeRef::Function(sig) => TypeRef::FunctionPointer(sig),
                inner => TypeRef::Pointer(Box::new(inner)),
            },
            TypeExpr::Reference(inner) => TypeRef::Reference(Box::new(self.resolve_type(inner, cx)?)),
            TypeExpr::RValueReference(inner) => {
                TypeRef::RValueReference(Box::new(self.resolve_type(inner, cx)?))
            }
            TypeExpr::Array(inner, size) => {
                TypeRef::Array(Box::new(self.resolve_type(inner, cx)?), size.clone())
            }
            TypeExpr::Function(sig) => TypeRef::Function(Box::new(self.resolve_signature(sig, cx)?)),
            TypeExpr::Qualified(qualifiers, inner) => {
                TypeRef::qualified(*qualifiers, self.resolve_type(inner, cx)?)
            }
            TypeExpr::Record(record) => {
                TypeRef::AnonymousRecord(Box::new(self.resolve_record(record, cx)?))
            }
            TypeExpr::Enum(e) => TypeRef::AnonymousEnum(Box::new(self.resolve_enum(e, cx)?)),
        };
        Ok(ty)
    }
}

/// Name lookup.
impl Resolver<'_> {
    /// Looks a name up from the innermost scope outwards. `kind` restricts the
    /// lookup to records or enums, for elaborated names.
    fn lookup(&mut self, path: &Path, kind: Option<NamedKind>, cx: &Cx) -> Result<TypeRef> {
        let first = &path.segments[0].name;
        if !path.absolute && cx.params.contains(first) {
            return Ok(if path.segments.len() == 1 {
                TypeRef::Param(first.clone())
            } else {
                TypeRef::Dependent(path.to_string())
            });
        }

        // Members of instantiations are not substituted.
        if path.segments[..path.segments.len() - 1].iter().any(|s| s.args.is_some()) {
            return Ok(TypeRef::Dependent(path.to_string()));
        }

        let name = path.plain_name();
        let scopes: Vec<&str> = if path.absolute {
            vec![""]
        } else {
            prefixes(&cx.scope).collect()
        };
        for scope in scopes {
            let qualified = qualify(scope, &name);
            if let Some(entry) = self.find_entry(&qualified, kind) {
                return self.bind(qualified, entry, path, cx);
            }
        }

        if WELL_KNOWN.contains(name.as_str()) {
            return Ok(TypeRef::Builtin(name));
        }
        if let Some(kind) = kind {
            return Ok(self.declare_implicitly(&name, kind, cx));
        }
        Err(ExtractError::UnresolvedType {
            file: self.origin.file.clone(),
            location: self.origin.position(),
            name: path.to_string(),
        })
    }

    fn find_entry(&self, qualified: &str, kind: Option<NamedKind>) -> Option<Entry> {
        let entries = self.names.get(qualified)?;
        // While a typedef is being resolved, its own name refers to the
        // record it may share the name with.
        let resolving = self.resolving.iter().any(|n| n == qualified);
        entries
            .iter()
            .filter(|e| e.matches(kind))
            .find(|e| !(resolving && matches!(e, Entry::Typedef { .. })))
            .or_else(|| entries.iter().find(|e| e.matches(kind)))
            .cloned()
    }

    fn bind(&mut self, qualified: String, entry: Entry, path: &Path, cx: &Cx) -> Result<TypeRef> {
        let ty = match entry {
            Entry::Record(kind) => TypeRef::Named {
                name: qualified,
                kind: kind.into(),
            },
            Entry::Enum => TypeRef::Named {
                name: qualified,
                kind: NamedKind::Enum,
            },
            Entry::Typedef { target, cx } => {
                let target = self.terminal(&qualified, &target, &cx)?;
                TypeRef::Alias {
                    name: qualified,
                    target: Box::new(target),
                }
            }
            Entry::Template {
                kind,
                params,
                cx: template_cx,
            } => match &path.last().args {
                Some(args) => {
                    let args = self.resolve_args(args, cx)?;
                    let instantiation = self.instantiate(qualified, &params, &template_cx, args)?;
                    TypeRef::Instantiation(Box::new(instantiation))
                }
                // The injected class name, within the template itself.
                None => TypeRef::Named {
                    name: qualified,
                    kind: kind.into(),
                },
            },
        };
        Ok(ty)
    }

    /// Resolves the target of a typedef, failing on cycles and on chains
    /// longer than the configured bound.
    fn resolve_typedef(&mut self, name: &str, target: &TypeExpr, cx: &Cx) -> Result<TypeRef> {
        let depth = self.config.max_typedef_depth;
        if self.resolving.len() >= depth || self.resolving.iter().any(|n| n == name) {
            let first = self.resolving.first().map_or(name, String::as_str);
            return Err(ExtractError::CyclicTypedef {
                file: self.origin.file.clone(),
                location: self.origin.position(),
                name: first.to_owned(),
                depth,
            });
        }
        self.resolving.push(name.to_owned());
        let ty = self.resolve_type(target, cx);
        self.resolving.pop();
        let ty = ty?;

        let length = match ty.unqualified() {
            TypeRef::Alias { name: next, .. } => self.chains.get(next).map_or(1, |n| n + 1),
            _ => 1,
        };
        if length > depth {
            return Err(ExtractError::CyclicTypedef {
                file: self.origin.file.clone(),
                location: self.origin.position(),
                name: name.to_owned(),
                depth,
            });
        }
        self.chains.insert(name.to_owned(), length);
        Ok(ty)
    }

    /// Returns the terminal, non-typedef target of a typedef.
    fn terminal(&mut self, name: &str, target: &TypeExpr, cx: &Cx) -> Result<TypeRef> {
        if let Some(terminal) = self.terminals.get(name) {
            return Ok(terminal.clone());
        }
        let terminal = match self.resolve_typedef(name, target, cx)? {
            TypeRef::Alias { target, .. } => *target,
            ty => ty,
        };
        self.terminals.insert(name.to_owned(), terminal.clone());
        Ok(terminal)
    }

    /// Declares a record or enum which is only ever named in elaborated form,
    /// as in `struct opaque *handle;`. It is placed in the innermost
    /// enclosing namespace.
    fn declare_implicitly(&mut self, name: &str, kind: NamedKind, cx: &Cx) -> TypeRef {
        let scope = prefixes(&cx.scope)
            .find(|scope| !self.record_scopes.contains(*scope))
            .unwrap_or("");
        let qualified = qualify(scope, name);
        let (parent, short) = split_scope(&qualified);
        let (decl, entry) = match kind {
            NamedKind::Enum => {
                let decl = Decl::Enum(EnumDecl {
                    name: Some(short.to_owned()),
                    scoped: false,
                    underlying: TypeRef::Primitive(Primitive::Int),
                    members: Vec::new(),
                    complete: false,
                    typedef_name: false,
                });
                (decl, Entry::Enum)
            }
            NamedKind::Struct | NamedKind::Class | NamedKind::Union => {
                let record_kind = match kind {
                    NamedKind::Class => RecordKind::Class,
                    NamedKind::Union => RecordKind::Union,
                    _ => RecordKind::Struct,
                };
                let decl = Decl::Record(RecordDecl::forward(short, record_kind));
                (decl, Entry::Record(record_kind))
            }
        };
        trace!(name = qualified.as_str(), "implicitly declared");

        let id = self.model.scope_or_insert(parent, ScopeKind::Namespace);
        let item = Item {
            decl,
            origin: self.origin.clone(),
        };
        self.model.insert_reporting(id, item, &mut self.diagnostics);
        self.names.entry(qualified.clone()).or_default().push(entry);
        TypeRef::Named {
            name: qualified,
            kind,
        }
    }
}

/// Template instantiation.
impl Resolver<'_> {
    /// Binds arguments to a class template, selecting the specialization
    /// that applies to them, if any. Members are not substituted.
    fn instantiate(
        &mut self,
        template: String,
        params: &[TemplateParam<Parsed>],
        cx: &Cx,
        args: Vec<TypeArg>,
    ) -> Result<Instantiation> {
        let args = self.fill_defaults(params, cx, args)?;
        let specialization = self.select_specialization(&template, &args)?;
        Ok(Instantiation {
            template,
            args,
            specialization,
        })
    }

    fn fill_defaults(
        &mut self,
        params: &[TemplateParam<Parsed>],
        cx: &Cx,
        mut args: Vec<TypeArg>,
    ) -> Result<Vec<TypeArg>> {
        let inner = cx.with_params(params);
        for param in params.iter().skip(args.len()) {
            if param.pack {
                break;
            }
            let arg = match &param.kind {
                TemplateParamKind::Type { default: Some(ty) } => {
                    TypeArg::Type(self.resolve_type(ty, &inner)?)
                }
                TemplateParamKind::NonType {
                    default: Some(text),
                    ..
                }
                | TemplateParamKind::Template {
                    default: Some(text),
                } => TypeArg::Literal(text.clone()),
                _ => break,
            };
            let bindings: HashMap<&str, &TypeArg> = params
                .iter()
                .zip(&args)
                .filter_map(|(p, arg)| Some((p.name.as_deref()?, arg)))
                .collect();
            let arg = substitute_arg(&arg, &bindings);
            args.push(arg);
        }
        Ok(args)
    }

    /// Full specializations matching exactly take precedence over partial
    /// ones. Among partial specializations, the first declared match wins.
    fn select_specialization(
        &mut self,
        template: &str,
        args: &[TypeArg],
    ) -> Result<Option<Vec<TypeArg>>> {
        let count = self.specializations.get(template).map_or(0, Vec::len);
        let actual: Vec<TypeArg> = args.iter().map(unaliased_arg).collect();
        let mut partial = None;
        for i in 0..count {
            let Some((written, filled, params)) = self.pattern(template, i)? else {
                continue;
            };
            let filled: Vec<TypeArg> = filled.iter().map(unaliased_arg).collect();
            if params.is_empty() {
                if filled == actual {
                    return Ok(Some(written));
                }
            } else if partial.is_none() && unify_args(&filled, &actual, &params) {
                partial = Some(written);
            }
        }
        Ok(partial)
    }

    /// Resolves the `i`th specialization pattern of a template on first use.
    /// Returns `None` for a pattern whose resolution is under way, as in
    /// `template <> class C<C<int>>`.
    #[allow(clippy::type_complexity)]
    fn pattern(
        &mut self,
        template: &str,
        i: usize,
    ) -> Result<Option<(Vec<TypeArg>, Vec<TypeArg>, Vec<String>)>> {
        let Some(pattern) = self
            .specializations
            .get_mut(template)
            .and_then(|patterns| patterns.get_mut(i))
        else {
            return Ok(None);
        };
        if let PatternState::Resolved { written, filled } = &pattern.state {
            return Ok(Some((written.clone(), filled.clone(), pattern.params.clone())));
        }
        if matches!(pattern.state, PatternState::InProgress) {
            return Ok(None);
        }
        pattern.state = PatternState::InProgress;
        let args = pattern.args.clone();
        let cx = pattern.cx.clone();
        let params = pattern.params.clone();

        let written = self.resolve_args(&args, &cx)?;
        let filled = match self.find_entry(template, None) {
            Some(Entry::Template {
                params: template_params,
                cx: template_cx,
                ..
            }) => self.fill_defaults(&template_params, &template_cx, written.clone())?,
            _ => written.clone(),
        };
        if let Some(pattern) = self
            .specializations
            .get_mut(template)
            .and_then(|patterns| patterns.get_mut(i))
        {
            pattern.state = PatternState::Resolved {
                written: written.clone(),
                filled: filled.clone(),
            };
        }
        Ok(Some((written, filled, params)))
    }
}

/// The scope of the declarations nested in a record, template or
/// specialization, with its template parameters.
fn member_scope(decl: &Decl<Parsed>, cx: &Cx) -> Option<Cx> {
    match decl {
        Decl::Record(r) => r.name.as_deref().map(|name| cx.enter(name)),
        Decl::Template(t) => t
            .record
            .name
            .as_deref()
            .map(|name| cx.enter(name).with_params(&t.params)),
        Decl::Specialization(s) => {
            let args: Vec<String> = s.args.iter().map(ToString::to_string).collect();
            let name = s.record.name.as_deref().unwrap_or(&s.template);
            let scope = format!("{name}<{}>", args.join(", "));
            Some(cx.enter(&scope).with_params(&s.params))
        }
        _ => None,
    }
}

/// The scope and its enclosing scopes, innermost first, ending with the
/// global scope.
fn prefixes(scope: &str) -> impl Iterator<Item = &str> {
    std::iter::successors(Some(scope), |&scope| {
        (!scope.is_empty()).then(|| split_scope(scope).0)
    })
}

fn substitute_arg(arg: &TypeArg, bindings: &HashMap<&str, &TypeArg>) -> TypeArg {
    match arg {
        TypeArg::Type(ty) => TypeArg::Type(substitute(ty, bindings)),
        TypeArg::Literal(literal) => match bindings.get(literal.as_str()) {
            Some(TypeArg::Literal(bound)) => TypeArg::Literal(bound.clone()),
            _ => arg.clone(),
        },
    }
}

/// Replaces bound template parameters within a type.
fn substitute(ty: &TypeRef, bindings: &HashMap<&str, &TypeArg>) -> TypeRef {
    let sub = |inner: &TypeRef| Box::new(substitute(inner, bindings));
    match ty {
        TypeRef::Param(name) => match bindings.get(name.as_str()) {
            Some(TypeArg::Type(bound)) => bound.clone(),
            _ => ty.clone(),
        },
        TypeRef::Pointer(inner) => TypeRef::Pointer(sub(inner)),
        TypeRef::Reference(inner) => TypeRef::Reference(sub(inner)),
        TypeRef::RValueReference(inner) => TypeRef::RValueReference(sub(inner)),
        TypeRef::Array(inner, size) => TypeRef::Array(sub(inner), size.clone()),
        TypeRef::Qualified(q, inner) => TypeRef::qualified(*q, substitute(inner, bindings)),
        TypeRef::Instantiation(inst) => TypeRef::Instantiation(Box::new(Instantiation {
            template: inst.template.clone(),
            args: inst.args.iter().map(|a| substitute_arg(a, bindings)).collect(),
            specialization: inst.specialization.clone(),
        })),
        _ => ty.clone(),
    }
}

/// Strips typedef names throughout a type, for comparisons.
fn unaliased(ty: &TypeRef) -> TypeRef {
    let strip = |inner: &TypeRef| Box::new(unaliased(inner));
    match ty {
        TypeRef::Alias { target, .. } => unaliased(target),
        TypeRef::Pointer(inner) => TypeRef::Pointer(strip(inner)),
        TypeRef::Reference(inner) => TypeRef::Reference(strip(inner)),
        TypeRef::RValueReference(inner) => TypeRef::RValueReference(strip(inner)),
        TypeRef::Array(inner, size) => TypeRef::Array(strip(inner), size.clone()),
        TypeRef::Qualified(q, inner) => TypeRef::qualified(*q, unaliased(inner)),
        TypeRef::Instantiation(inst) => TypeRef::Instantiation(Box::new(Instantiation {
            template: inst.template.clone(),
            args: inst.args.iter().map(unaliased_arg).collect(),
            specialization: None,
        })),
        _ => ty.clone(),
    }
}

fn unaliased_arg(arg: &TypeArg) -> TypeArg {
    match arg {
        TypeArg::Type(ty) => TypeArg::Type(unaliased(ty)),
        TypeArg::Literal(_) => arg.clone(),
    }
}

fn unify_args(pattern: &[TypeArg], actual: &[TypeArg], params: &[String]) -> bool {
    let mut bindings = HashMap::new();
    pattern.len() == actual.len()
        && pattern
            .iter()
            .zip(actual)
            .all(|(p, a)| unify_arg(p, a, params, &mut bindings))
}

fn unify_arg(
    pattern: &TypeArg,
    actual: &TypeArg,
    params: &[String],
    bindings: &mut HashMap<String, TypeArg>,
) -> bool {
    match (pattern, actual) {
        (TypeArg::Type(TypeRef::Param(name)), _) if params.contains(name) => {
            bind_param(name, actual, bindings)
        }
        (TypeArg::Literal(name), _) if params.contains(name) => bind_param(name, actual, bindings),
        (TypeArg::Type(p), TypeArg::Type(a)) => unify(p, a, params, bindings),
        (TypeArg::Literal(p), TypeArg::Literal(a)) => p == a,
        _ => false,
    }
}

fn bind_param(name: &str, actual: &TypeArg, bindings: &mut HashMap<String, TypeArg>) -> bool {
    match bindings.get(name) {
        Some(bound) => bound == actual,
        None => {
            bindings.insert(name.to_owned(), actual.clone());
            true
        }
    }
}

/// Matches a specialization argument such as `T *` against an actual
/// argument, binding the specialization's parameters.
fn unify(
    pattern: &TypeRef,
    actual: &TypeRef,
    params: &[String],
    bindings: &mut HashMap<String, TypeArg>,
) -> bool {
    match (pattern, actual) {
        (TypeRef::Param(name), _) if params.contains(name) => {
            bind_param(name, &TypeArg::Type(actual.clone()), bindings)
        }
        (TypeRef::Pointer(p), TypeRef::Pointer(a))
        | (TypeRef::Reference(p), TypeRef::Reference(a))
        | (TypeRef::RValueReference(p), TypeRef::RValueReference(a)) => {
            unify(p, a, params, bindings)
        }
        (TypeRef::Array(p, p_size), TypeRef::Array(a, a_size)) => {
            p_size == a_size && unify(p, a, params, bindings)
        }
        (TypeRef::Qualified(pq, p), TypeRef::Qualified(aq, a)) => {
            pq == aq && unify(p, a, params, bindings)
        }
        (TypeRef::Instantiation(p), TypeRef::Instantiation(a)) => {
            p.template == a.template
                && p.args.len() == a.args.len()
                && p.args
                    .iter()
                    .zip(&a.args)
                    .all(|(p, a)| unify_arg(p, a, params, bindings))
        }
        (p, a) => p == a,
    }
}

#[cfg(test)]
mod tests {
    use crate::util::test_utils::tree_tests;

    tree_tests!(
        use resolver;

        fn test_c_declarations() {
            let header = "
                typedef struct { int width; int height; } Size;
                typedef void (*Callback)(void *user_data);
                enum LogLevel { LOG_INFO, LOG_ERROR };
                void log_printf(enum LogLevel level, const char *fmt, ...);
            ";
            let tree_ok = "
                struct Size (typedef)
                  field width: int
                  field height: int
                typedef Callback = void (*)(void *)
                enum LogLevel : int
                  LOG_INFO
                  LOG_ERROR
                function log_printf(level: enum LogLevel, fmt: const char *, ...) -> void
            ";
        }

        fn test_names_are_qualified_by_scope() {
            let header = "
                namespace geo {
                struct Point { double x; double y; };
                typedef Point Vec2;
                namespace detail { struct Cache { Point origin; Vec2 offset; }; }
                }
            ";
            let tree_ok = "
                namespace geo
                  struct Point
                    field x: double
                    field y: double
                  typedef Vec2 = geo::Point
                namespace geo::detail
                  struct Cache
                    field origin: geo::Point
                    field offset: geo::Vec2
            ";
        }

        fn test_nested_declarations_live_in_record_scopes() {
            let header = "
                class List {
                public:
                    typedef int size_type;
                    struct Node { Node *next; };
                    size_type count() const;
                    Node *head;
                };
            ";
            let tree_ok = "
                class List
                  field head: List::Node *
                  method count() -> List::size_type [const]
                record List
                  typedef size_type = int
                  struct Node
                    field next: List::Node *
            ";
        }

        fn test_typedef_chains_reach_their_terminal_type() {
            let header = "
                typedef int Base;
                typedef Base Middle;
                typedef const Middle Top;
                Top value;
            ";
            let tree_ok = "
                typedef Base = int
                typedef Middle = Base (terminal int)
                typedef Top = const Middle (terminal int)
                variable value: Top
            ";
        }

        fn test_cyclic_typedefs_drop_the_file() {
            let header = "
                typedef A B;
                typedef B A;
            ";
            let tree_error = "";
            let expected_errors = &[
                "test.h:1:1: error: typedef `B` does not reach a terminal type within 32 steps [CyclicTypedef]",
            ];
        }

        fn test_unresolved_types_drop_the_file() {
            let header = "
                struct Line {
                    Point start;
                };
            ";
            let tree_error = "";
            let expected_errors = &[
                "test.h:1:1: error: unresolved type `Point` [UnresolvedType]",
            ];
        }

        fn test_forward_declarations_satisfy_lookups() {
            let header = "
                class Widget;
                struct Event {
                    struct Opaque *handle;
                    Widget *owner;
                };
            ";
            let tree_ok = "
                class Widget (incomplete)
                struct Opaque (incomplete)
                struct Event
                  field handle: Opaque *
                  field owner: Widget *
            ";
        }

        fn test_instantiations_select_specializations() {
            let header = "
                template <typename T, int N = 4>
                class Container {
                public:
                    T items[N];
                };
                template <> class Container<int> { public: int total; };
                template <typename T> class Container<T *> { public: T *first; };
                struct Holder {
                    Container<int> ints;
                    Container<char *> names;
                    Container<double, 8> doubles;
                };
            ";
            let tree_ok = "
                template <typename T, int N = 4> class Container
                  field items: T[N]
                specialization Container<int>
                  field total: int
                specialization <typename T> Container<T *>
                  field first: T *
                struct Holder
                  field ints: Container<int, 4> (specialization <int>)
                  field names: Container<char *, 4> (specialization <T *>)
                  field doubles: Container<double, 8>
            ";
        }

        fn test_function_templates_bind_their_parameters() {
            let header = "
                template <typename T>
                T max_of(const T &a, const T &b);
            ";
            let tree_ok = "
                template <typename T> function max_of(a: const T &, b: const T &) -> T
            ";
        }

        fn test_orphaned_specializations_are_kept() {
            let header = "
                template <> struct Traits<int> { int size; };
            ";
            let tree_error = "
                specialization Traits<int> (orphaned)
                  field size: int
            ";
            let expected_errors = &[
                "test.h:1:1: note: specialization of unknown template `Traits` [OrphanedSpecialization]",
            ];
        }

        fn test_dropped_files_keep_earlier_diagnostics() {
            let header = "
                struct A { int x; };
                struct A { int y; };
                template <> struct T<int> {};
                struct B { Missing m; };
            ";
            let tree_error = "";
            let expected_errors = &[
                "test.h:2:1: warning: conflicting redeclaration of struct `A` (first defined at test.h:1:1) [ConflictingRedeclaration]",
                "test.h:3:1: note: specialization of unknown template `T` [OrphanedSpecialization]",
                "test.h:4:1: error: unresolved type `Missing` [UnresolvedType]",
            ];
        }

        fn test_well_known_library_types() {
            let header = "
                #include <stddef.h>
                size_t length(const char *text);
            ";
            let tree_ok = "
                function length(text: const char *) -> size_t
            ";
        }

        fn test_macro_constants_come_first() {
            let header = r#"
                struct Options { int flags; };
                #define MAX_PATH 260
                #define VERSION "1.2"
                #define RATIO (-0.5)
                #define EMPTY
                #define TWICE (MAX_PATH * 2)
            "#;
            let tree_ok = r#"
                constant MAX_PATH = 260
                constant VERSION = "1.2"
                constant RATIO = -0.5
                constant TWICE = 520
                struct Options
                  field flags: int
            "#;
        }
    );
}
