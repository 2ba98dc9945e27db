//! Recognizes declarations in a preprocessed token stream.
//!
//! Only declarations are understood. Function bodies, initializers and
//! default arguments are skipped structurally. A declaration which cannot be
//! recognized is skipped up to the next `;` (or closing brace) at its own
//! nesting level and reported, and parsing resumes with the next one.

use std::borrow::Cow;

use crate::{
    ast::{Item, ItemKind, Path, PathSegment, TranslationUnit, TypeArg, TypeExpr},
    diagnostic::DiagnosticKind,
    lexer::extract,
    model::{
        Access, BaseSpec, Decl, EnumDecl, Enumerator, Field, FunctionDecl, FunctionKind,
        FunctionQualifiers, NamedKind, Origin, Parameter, Parsed, Primitive, Qualifiers,
        RecordDecl, RecordKind, Signature, SpecializationDecl, TemplateDecl, TemplateParam,
        TemplateParamKind, TypedefDecl, Value, VariableDecl,
    },
    token::{spell, Location, Spanned, Token, TokenKind},
};

type Result<T, E = ()> = std::result::Result<T, E>;

pub type ParseResult<'src, T> = Result<T, (T, Vec<Spanned<'src, Error>>)>;

/// Skipped declarations are quoted up to this many characters.
const MAX_QUOTED_LEN: usize = 60;

/// Parses a token stream, as produced by the preprocessor, into its
/// declarations. The partial unit is returned along with the errors if any
/// declaration had to be skipped.
pub fn parse_unit<'src>(tokens: &[Token<'src>]) -> ParseResult<'src, TranslationUnit> {
    let tokens: Cow<'_, [Token<'src>]> = match tokens.last() {
        Some(last) if last.is_eof() => Cow::Borrowed(tokens),
        last => {
            let loc = last.map_or(Location::SYNTHETIC, |t| t.loc);
            let mut owned = tokens.to_vec();
            owned.push(Token::eof(loc));
            Cow::Owned(owned)
        }
    };

    let mut p = Parser::new(&tokens);
    let items = p.parse_items(TokenKind::Eof);
    let unit = TranslationUnit { items };
    if p.errors.is_empty() {
        Ok(unit)
    } else {
        Err((unit, p.errors))
    }
}

struct Parser<'src, 'tok> {
    tokens: &'tok [Token<'src>],
    cursor: usize,
    errors: Vec<Spanned<'src, Error>>,
    /// The first error of the declaration being parsed. It is reported once
    /// the declaration is skipped.
    reason: Option<Spanned<'src, Error>>,
    /// Token range of the offending invocation, for
    /// [`Error::UnsupportedMacro`].
    macro_span: (usize, usize),
    /// Names of the enclosing namespaces and records.
    scope: Vec<String>,
}

/// Members collected while parsing a record body.
struct Members {
    name: Option<String>,
    access: Access,
    fields: Vec<Field<Parsed>>,
    methods: Vec<FunctionDecl<Parsed>>,
}

#[derive(Default)]
struct Specifiers {
    is_typedef: bool,
    is_extern: bool,
    is_static: bool,
    is_inline: bool,
    is_virtual: bool,
    is_explicit: bool,
    is_friend: bool,
    qualifiers: Qualifiers,
    /// Arithmetic type keywords, in any order (`unsigned long int`).
    primitives: Vec<TokenKind>,
    base: Option<TypeExpr>,
    /// A record or enum defined in place.
    defined: Option<Defined>,
    /// What `struct X;` declares when it stands alone.
    forward: Option<Defined>,
}

impl Specifiers {
    fn has_type(&self) -> bool {
        !self.primitives.is_empty() || self.base.is_some() || self.defined.is_some()
    }

    fn ty(&self) -> Option<TypeExpr> {
        let ty = primitive(&self.primitives)
            .map(TypeExpr::Primitive)
            .or_else(|| self.base.clone())?;
        Some(TypeExpr::qualified(self.qualifiers, ty))
    }
}

struct Defined {
    def: Definition,
    nested: Vec<Item>,
    origin: Origin,
    /// The name as written. Template arguments on its last segment make the
    /// definition a specialization.
    path: Option<Path>,
}

enum Definition {
    Record(RecordDecl<Parsed>),
    Enum(EnumDecl<Parsed>),
}

impl Definition {
    fn name(&self) -> Option<&str> {
        match self {
            Definition::Record(r) => r.name.as_deref(),
            Definition::Enum(e) => e.name.as_deref(),
        }
    }

    fn kind(&self) -> NamedKind {
        match self {
            Definition::Record(r) => r.kind.into(),
            Definition::Enum(_) => NamedKind::Enum,
        }
    }

    fn name_by_typedef(&mut self, name: String) {
        match self {
            Definition::Record(r) => {
                r.name = Some(name);
                r.typedef_name = true;
            }
            Definition::Enum(e) => {
                e.name = Some(name);
                e.typedef_name = true;
            }
        }
    }

    fn into_type(self) -> TypeExpr {
        match self {
            Definition::Record(r) => TypeExpr::Record(Box::new(r)),
            Definition::Enum(e) => TypeExpr::Enum(Box::new(e)),
        }
    }

    fn into_decl(self) -> Decl<Parsed> {
        match self {
            Definition::Record(r) => Decl::Record(r),
            Definition::Enum(e) => Decl::Enum(e),
        }
    }
}

enum DeclName {
    Plain(String),
    Destructor(String),
    /// Such as `operator==`.
    Operator(String),
    /// The target type of a conversion operator.
    Conversion(TypeExpr),
}

/// A type operator applied by a declarator.
enum TypeOp {
    Pointer(Qualifiers),
    Reference,
    RValueReference,
    Array(Option<Value>),
    Function(FunctionSuffix),
}

#[derive(Default)]
struct FunctionSuffix {
    params: Vec<Parameter<Parsed>>,
    variadic: bool,
    is_const: bool,
    /// `-> T`.
    trailing: Option<TypeExpr>,
}

impl FunctionSuffix {
    fn into_signature(self, return_ty: TypeExpr) -> Signature<Parsed> {
        Signature {
            return_ty: self.trailing.unwrap_or(return_ty),
            params: self.params,
            variadic: self.variadic,
        }
    }
}

struct Declarator<'src, 'tok> {
    name: Option<DeclName>,
    /// Whether the name is qualified, as in out-of-line member definitions.
    qualified: bool,
    /// `Ts... args`.
    pack: bool,
    token: &'tok Token<'src>,
    /// Applied to the base type in order.
    ops: Vec<TypeOp>,
}

impl Declarator<'_, '_> {
    fn is_function(&self) -> bool {
        matches!(self.ops.last(), Some(TypeOp::Function(_)))
    }

    fn plain_name(&self) -> Option<&str> {
        match &self.name {
            Some(DeclName::Plain(name)) if !self.qualified => Some(name),
            _ => None,
        }
    }
}

#[derive(Default)]
struct Tail {
    bit_width: Option<Value>,
    is_pure: bool,
    has_body: bool,
}

impl<'src, 'tok> Parser<'src, 'tok> {
    fn new(tokens: &'tok [Token<'src>]) -> Self {
        Parser {
            tokens,
            cursor: 0,
            errors: Vec::new(),
            reason: None,
            macro_span: (0, 0),
            scope: Vec::new(),
        }
    }

    fn parse_items(&mut self, end: TokenKind) -> Vec<Item> {
        let mut items = Vec::new();
        while self.except([end]) {
            if self.take(TokenKind::Semicolon) {
                continue;
            }
            let start = self.cursor;
            if self.parse_item(&mut items).is_err() {
                self.recover(start);
            }
        }
        items
    }

    fn parse_item(&mut self, out: &mut Vec<Item>) -> Result<()> {
        use TokenKind::*;
        let c = self.peek();
        match c.kind {
            Namespace => self.parse_namespace(false, out),
            Inline if self.nth(1).kind == Namespace => {
                self.advance();
                self.parse_namespace(true, out)
            }
            Extern if self.nth(1).kind == String && self.nth(2).kind == LBrace => {
                self.advance();
                self.advance();
                self.advance();
                let items = self.parse_items(RBrace);
                out.extend(items);
                self.consume(RBrace)?;
                Ok(())
            }
            Template => self.parse_template(None, out),
            Using => self.parse_using(out),
            Identifier if c.text() == "static_assert" => {
                self.skip_declaration();
                Ok(())
            }
            _ => self.parse_declaration(None, None, self.origin(), out),
        }
    }

    fn parse_namespace(&mut self, inline: bool, out: &mut Vec<Item>) -> Result<()> {
        let origin = self.origin();
        self.consume(TokenKind::Namespace)?;
        if self.is(TokenKind::Identifier) && self.nth(1).kind == TokenKind::Eq {
            // Aliases introduce no declarations.
            self.skip_declaration();
            return Ok(());
        }

        let mut names = Vec::new();
        while self.is(TokenKind::Identifier) {
            names.push(self.advance().text().to_owned());
            if !self.take(TokenKind::ColonColon) {
                break;
            }
            self.take(TokenKind::Inline);
        }
        self.skip_attributes();
        self.consume(TokenKind::LBrace)?;

        // Inline namespaces are transparent, like anonymous ones.
        if inline {
            names.clear();
        }
        let depth = self.scope.len();
        self.scope.extend(names.iter().cloned());
        let items = self.parse_items(TokenKind::RBrace);
        self.scope.truncate(depth);
        self.consume(TokenKind::RBrace)?;

        let item = if names.is_empty() {
            Item {
                kind: ItemKind::Namespace { name: None, items },
                origin,
            }
        } else {
            let mut items = items;
            while names.len() > 1 {
                let name = names.pop();
                items = vec![Item {
                    kind: ItemKind::Namespace { name, items },
                    origin: origin.clone(),
                }];
            }
            Item {
                kind: ItemKind::Namespace {
                    name: names.pop(),
                    items,
                },
                origin,
            }
        };
        out.push(item);
        Ok(())
    }

    fn parse_using(&mut self, out: &mut Vec<Item>) -> Result<()> {
        let origin = self.origin();
        self.consume(TokenKind::Using)?;
        if !(self.is(TokenKind::Identifier) && self.nth(1).kind == TokenKind::Eq) {
            // Using-directives and using-declarations only affect lookup.
            self.skip_declaration();
            return Ok(());
        }
        let name = self.advance().text().to_owned();
        self.advance();
        let ty = self.parse_type()?;
        self.consume(TokenKind::Semicolon)?;
        out.push(Item {
            kind: ItemKind::Decl {
                decl: Decl::Typedef(TypedefDecl { name, ty }),
                nested: Vec::new(),
            },
            origin,
        });
        Ok(())
    }

    fn parse_template(&mut self, members: Option<&mut Members>, out: &mut Vec<Item>) -> Result<()> {
        let origin = self.origin();
        let start = self.cursor;
        self.consume(TokenKind::Template)?;
        if !self.is(TokenKind::Less) {
            // Explicit instantiations declare nothing new.
            self.skip_declaration();
            return Ok(());
        }
        let params = self.parse_template_params()?;
        let unmodeled = match self.peek().kind {
            // Out-of-line members of class templates repeat what the class
            // declares.
            TokenKind::Template => None,
            TokenKind::Using => Some("alias template"),
            TokenKind::Friend => Some("template friend"),
            _ => return self.parse_declaration(members, Some(params), origin, out),
        };
        self.skip_declaration();
        if let Some(what) = unmodeled {
            self.unmodeled(start, what);
        }
        Ok(())
    }

    /// Parses a declaration starting at `origin`, which includes any leading
    /// `template <...>`. Every item it declares is located there.
    fn parse_declaration(
        &mut self,
        mut members: Option<&mut Members>,
        template: Option<Vec<TemplateParam<Parsed>>>,
        origin: Origin,
        out: &mut Vec<Item>,
    ) -> Result<()> {
        let record_name = members.as_ref().and_then(|m| m.name.clone());
        let mut specs = self.parse_specifiers(record_name.as_deref())?;
        for defined in specs.defined.iter_mut().chain(specs.forward.iter_mut()) {
            defined.origin = origin.clone();
        }
        if specs.is_friend {
            self.skip_declaration();
            return Ok(());
        }
        if self.take(TokenKind::Semicolon) {
            self.declare_alone(specs, members, template, out);
            return Ok(());
        }

        let mut declarators = Vec::new();
        loop {
            let declarator = self.parse_declarator()?;
            let tail = self.parse_declarator_tail(&declarator)?;
            let has_body = tail.has_body;
            declarators.push((declarator, tail));
            if has_body {
                self.take(TokenKind::Semicolon);
                break;
            }
            if !self.take(TokenKind::Comma) {
                self.consume(TokenKind::Semicolon)?;
                break;
            }
        }

        let mut base = specs.ty();
        let mut collapsed = false;
        if let Some(mut defined) = specs.defined.take() {
            let alias = match declarators.first() {
                Some((d, _)) if specs.is_typedef && d.ops.is_empty() => d.plain_name(),
                _ => None,
            };
            if let Some(alias) = alias {
                if defined.def.name().map_or(true, |name| name == alias) {
                    defined.def.name_by_typedef(alias.to_owned());
                    collapsed = true;
                }
            }
            let ty = if let Some(name) = defined.def.name() {
                let ty = TypeExpr::Elaborated(defined.def.kind(), Path::simple(name));
                self.push_definition(defined, None, out);
                ty
            } else {
                defined.def.into_type()
            };
            base = Some(TypeExpr::qualified(specs.qualifiers, ty));
        }

        for (index, (declarator, tail)) in declarators.into_iter().enumerate() {
            if (collapsed && index == 0) || declarator.qualified {
                // Out-of-line definitions repeat what the class declares.
                continue;
            }
            let Declarator {
                name, token, mut ops, ..
            } = declarator;
            let origin = origin.clone();

            let function = match ops.pop() {
                Some(TypeOp::Function(suffix)) if !specs.is_typedef => Some(suffix),
                Some(op) => {
                    ops.push(op);
                    None
                }
                None => None,
            };
            let Some(name) = name else {
                return self.fail(token, Error::ExpectedName);
            };

            if let Some(suffix) = function {
                let function = FunctionParts {
                    name,
                    token,
                    suffix,
                    base: base.clone(),
                    ops,
                };
                let decl = self.function(function, &specs, &tail, members.as_deref(), &template)?;
                match members.as_deref_mut() {
                    Some(members) => members.methods.push(decl),
                    None => out.push(Item {
                        kind: ItemKind::Decl {
                            decl: Decl::Function(decl),
                            nested: Vec::new(),
                        },
                        origin,
                    }),
                }
                continue;
            }
            if template.is_some() {
                self.errors.push(token.wrap(Error::Unmodeled {
                    what: "variable template",
                    text: token.text().to_owned(),
                }));
                continue;
            }

            let Some(base) = base.clone() else {
                return self.fail(token, Error::ExpectedType);
            };
            let DeclName::Plain(name) = name else {
                return self.fail(token, Error::ExpectedName);
            };
            let ty = apply(base, ops);
            let decl = if specs.is_typedef {
                Decl::Typedef(TypedefDecl { name, ty })
            } else if let Some(members) = members.as_deref_mut() {
                members.fields.push(Field {
                    name: Some(name),
                    ty,
                    bit_width: tail.bit_width,
                    access: members.access,
                    ordinal: members.fields.len(),
                    is_static: specs.is_static,
                });
                continue;
            } else {
                Decl::Variable(VariableDecl {
                    name,
                    ty,
                    is_extern: specs.is_extern,
                    is_static: specs.is_static,
                })
            };
            out.push(Item {
                kind: ItemKind::Decl {
                    decl,
                    nested: Vec::new(),
                },
                origin,
            });
        }
        Ok(())
    }

    /// Handles specifiers with no declarators, such as `struct X;` or a
    /// definition followed directly by `;`.
    fn declare_alone(
        &mut self,
        specs: Specifiers,
        members: Option<&mut Members>,
        template: Option<Vec<TemplateParam<Parsed>>>,
        out: &mut Vec<Item>,
    ) {
        let Some(Defined {
            def,
            nested,
            origin,
            path,
        }) = specs.defined.or(specs.forward)
        else {
            return;
        };
        match (def, members) {
            (Definition::Record(record), Some(members)) if record.name.is_none() => {
                // An anonymous struct or union member.
                out.extend(nested);
                members.fields.push(Field {
                    name: None,
                    ty: TypeExpr::Record(Box::new(record)),
                    bit_width: None,
                    access: members.access,
                    ordinal: members.fields.len(),
                    is_static: false,
                });
            }
            (def, _) => {
                let defined = Defined {
                    def,
                    nested,
                    origin,
                    path,
                };
                self.push_definition(defined, template, out);
            }
        }
    }

    fn push_definition(
        &mut self,
        defined: Defined,
        template: Option<Vec<TemplateParam<Parsed>>>,
        out: &mut Vec<Item>,
    ) {
        let Defined {
            def,
            nested,
            origin,
            path,
        } = defined;
        let args = path.as_ref().and_then(|p| p.last().args.clone());
        let decl = match (def, template, args) {
            (Definition::Record(record), params, Some(args)) => {
                Decl::Specialization(SpecializationDecl {
                    template: path.map(|p| p.plain_name()).unwrap_or_default(),
                    params: params.unwrap_or_default(),
                    args,
                    record,
                    orphaned: false,
                })
            }
            (Definition::Record(record), Some(params), None) if !params.is_empty() => {
                Decl::Template(TemplateDecl { params, record })
            }
            (def, _, _) => def.into_decl(),
        };
        out.push(Item {
            kind: ItemKind::Decl { decl, nested },
            origin,
        });
    }

    fn function(
        &mut self,
        parts: FunctionParts<'src, 'tok>,
        specs: &Specifiers,
        tail: &Tail,
        members: Option<&Members>,
        template: &Option<Vec<TemplateParam<Parsed>>>,
    ) -> Result<FunctionDecl<Parsed>> {
        let FunctionParts {
            name,
            token,
            suffix,
            base,
            ops,
        } = parts;
        let void = TypeExpr::Primitive(Primitive::Void);
        let (name, kind, return_ty) = match (name, base) {
            (DeclName::Plain(name), Some(base)) => {
                let kind = if members.is_some() {
                    FunctionKind::Method
                } else {
                    FunctionKind::Free
                };
                (name, kind, apply(base, ops))
            }
            (DeclName::Plain(name), None) if members.is_some() => {
                (name, FunctionKind::Constructor, void)
            }
            (DeclName::Destructor(name), _) => (format!("~{name}"), FunctionKind::Destructor, void),
            (DeclName::Operator(name), Some(base)) => (name, FunctionKind::Operator, apply(base, ops)),
            (DeclName::Conversion(ty), _) => {
                (format!("operator {ty}"), FunctionKind::Conversion, ty)
            }
            (DeclName::Plain(_) | DeclName::Operator(_), None) => {
                return self.fail(token, Error::ExpectedType);
            }
        };

        let qualifiers = FunctionQualifiers {
            is_virtual: specs.is_virtual,
            is_pure: tail.is_pure,
            is_const: suffix.is_const,
            is_static: specs.is_static,
            is_inline: specs.is_inline,
            is_extern: specs.is_extern,
            is_explicit: specs.is_explicit,
        };
        Ok(FunctionDecl {
            name,
            kind,
            signature: suffix.into_signature(return_ty),
            qualifiers,
            access: members.map_or(Access::Public, |m| m.access),
            template_params: template.clone().unwrap_or_default(),
            scope: self.scope.join("::"),
        })
    }

    fn parse_specifiers(&mut self, record_name: Option<&str>) -> Result<Specifiers> {
        use TokenKind::*;
        let mut s = Specifiers::default();
        loop {
            self.skip_attributes();
            let c = self.peek();
            match c.kind {
                Typedef => s.is_typedef = true,
                Extern => {
                    s.is_extern = true;
                    // `extern "C" int f(void);`
                    if self.nth(1).kind == String {
                        self.advance();
                    }
                }
                Static => s.is_static = true,
                Inline => s.is_inline = true,
                Virtual => s.is_virtual = true,
                Explicit => s.is_explicit = true,
                Friend => s.is_friend = true,
                Mutable | Register | Constexpr | Restrict => {}
                Const => s.qualifiers.is_const = true,
                Volatile => s.qualifiers.is_volatile = true,
                k if k.is_primitive() && s.base.is_none() && s.defined.is_none() => {
                    s.primitives.push(k);
                }
                Struct | Class | Union if !s.has_type() => {
                    self.parse_record(&mut s)?;
                    continue;
                }
                Enum if !s.has_type() => {
                    self.parse_enum(&mut s)?;
                    continue;
                }
                Typename if !s.has_type() => {
                    self.advance();
                    s.base = Some(TypeExpr::Dependent(self.parse_path()?));
                    continue;
                }
                Identifier if is_ignored_specifier(c.text()) => {}
                Identifier | ColonColon if !s.has_type() => {
                    if c.kind == Identifier && self.nth(1).kind == LParen {
                        if record_name == Some(c.text()) {
                            // A constructor.
                            break;
                        }
                        return self.unsupported_macro();
                    }
                    let start = self.cursor;
                    let path = self.parse_path()?;
                    if path.segments.len() > 1 && self.is(LParen) {
                        // An out-of-line constructor, such as `X::X(int)`.
                        self.cursor = start;
                        break;
                    }
                    if path.is_simple() && self.looks_like_macro() {
                        self.cursor = start;
                        return self.unsupported_macro();
                    }
                    s.base = Some(TypeExpr::Path(path));
                    continue;
                }
                _ => break,
            }
            self.advance();
        }
        Ok(s)
    }

    /// Whether the identifier just parsed as a type name is rather an unknown
    /// object-like macro, as in `CORE_API void f();`.
    fn looks_like_macro(&self) -> bool {
        use TokenKind::*;
        let next = self.peek().kind;
        next.is_primitive()
            || matches!(next, Struct | Class | Union | Enum | Typename)
            || (next == Identifier && matches!(self.nth(1).kind, Identifier | Star | Amp | AmpAmp))
    }

    fn parse_record(&mut self, s: &mut Specifiers) -> Result<()> {
        let origin = self.origin();
        let kind = match self.advance().kind {
            TokenKind::Struct => RecordKind::Struct,
            TokenKind::Class => RecordKind::Class,
            _ => RecordKind::Union,
        };
        self.skip_attributes();

        let start = self.cursor;
        let path = if matches!(self.peek().kind, TokenKind::Identifier | TokenKind::ColonColon) {
            Some(self.parse_path()?)
        } else {
            None
        };
        if path.as_ref().is_some_and(Path::is_simple)
            && self.is(TokenKind::Identifier)
            && !self.is_contextual("final")
            && matches!(self.nth(1).kind, TokenKind::LBrace | TokenKind::Colon)
        {
            // `class CORE_API Name {`
            self.cursor = start;
            return self.unsupported_macro();
        }
        if self.is_contextual("final") {
            self.advance();
        }
        let bases = if self.take(TokenKind::Colon) {
            self.parse_bases(kind)?
        } else {
            Vec::new()
        };

        if !self.is(TokenKind::LBrace) {
            let Some(path) = path else {
                return self.fail_here(Error::ExpectedName);
            };
            s.base = Some(TypeExpr::Elaborated(kind.into(), path.clone()));
            s.forward = Some(Defined {
                def: Definition::Record(RecordDecl::forward(path.last().name.clone(), kind)),
                nested: Vec::new(),
                origin,
                path: Some(path),
            });
            return Ok(());
        }

        let mut record = RecordDecl {
            name: path.as_ref().map(|p| p.last().name.clone()),
            kind,
            fields: Vec::new(),
            methods: Vec::new(),
            bases,
            complete: true,
            typedef_name: false,
        };
        let nested = self.parse_record_body(&mut record)?;
        s.defined = Some(Defined {
            def: Definition::Record(record),
            nested,
            origin,
            path,
        });
        Ok(())
    }

    fn parse_bases(&mut self, kind: RecordKind) -> Result<Vec<BaseSpec<Parsed>>> {
        let mut bases = Vec::new();
        loop {
            let mut is_virtual = self.take(TokenKind::Virtual);
            let access = match self.peek().kind {
                TokenKind::Public => Access::Public,
                TokenKind::Protected => Access::Protected,
                TokenKind::Private => Access::Private,
                _ => kind.default_access(),
            };
            if matches!(
                self.peek().kind,
                TokenKind::Public | TokenKind::Protected | TokenKind::Private
            ) {
                self.advance();
            }
            is_virtual |= self.take(TokenKind::Virtual);
            let name = self.parse_path()?;
            self.take(TokenKind::Ellipsis);
            bases.push(BaseSpec {
                name,
                access,
                is_virtual,
            });
            if !self.take(TokenKind::Comma) {
                break Ok(bases);
            }
        }
    }

    fn parse_record_body(&mut self, record: &mut RecordDecl<Parsed>) -> Result<Vec<Item>> {
        use TokenKind::*;
        self.consume(LBrace)?;
        let mut members = Members {
            name: record.name.clone(),
            access: record.kind.default_access(),
            fields: Vec::new(),
            methods: Vec::new(),
        };
        let mut nested = Vec::new();

        let depth = self.scope.len();
        self.scope.extend(record.name.clone());
        while self.except([RBrace]) {
            let c = self.peek();
            match c.kind {
                Public | Protected | Private if self.nth(1).kind == Colon => {
                    members.access = match c.kind {
                        Public => Access::Public,
                        Protected => Access::Protected,
                        _ => Access::Private,
                    };
                    self.advance();
                    self.advance();
                    continue;
                }
                Semicolon => {
                    self.advance();
                    continue;
                }
                _ => {}
            }

            let start = self.cursor;
            let result = match c.kind {
                Template => self.parse_template(Some(&mut members), &mut nested),
                Using => self.parse_using(&mut nested),
                Identifier if c.text() == "static_assert" => {
                    self.skip_declaration();
                    Ok(())
                }
                _ => self.parse_declaration(Some(&mut members), None, self.origin(), &mut nested),
            };
            if result.is_err() {
                self.recover(start);
            }
        }
        self.scope.truncate(depth);
        self.consume(RBrace)?;

        record.fields = members.fields;
        record.methods = members.methods;
        Ok(nested)
    }

    fn parse_enum(&mut self, s: &mut Specifiers) -> Result<()> {
        let origin = self.origin();
        self.consume(TokenKind::Enum)?;
        let scoped = self.take(TokenKind::Class) || self.take(TokenKind::Struct);
        self.skip_attributes();
        let path = if matches!(self.peek().kind, TokenKind::Identifier | TokenKind::ColonColon) {
            Some(self.parse_path()?)
        } else {
            None
        };
        let underlying = if self.take(TokenKind::Colon) {
            self.parse_type()?
        } else {
            TypeExpr::Primitive(Primitive::Int)
        };

        let mut decl = EnumDecl {
            name: path.as_ref().map(|p| p.last().name.clone()),
            scoped,
            underlying,
            members: Vec::new(),
            complete: false,
            typedef_name: false,
        };
        if !self.is(TokenKind::LBrace) {
            let Some(path) = path else {
                return self.fail_here(Error::ExpectedName);
            };
            s.base = Some(TypeExpr::Elaborated(NamedKind::Enum, path.clone()));
            s.forward = Some(Defined {
                def: Definition::Enum(decl),
                nested: Vec::new(),
                origin,
                path: Some(path),
            });
            return Ok(());
        }

        decl.members = self.parse_enumerators()?;
        decl.complete = true;
        s.defined = Some(Defined {
            def: Definition::Enum(decl),
            nested: Vec::new(),
            origin,
            path,
        });
        Ok(())
    }

    fn parse_enumerators(&mut self) -> Result<Vec<Enumerator>> {
        self.consume(TokenKind::LBrace)?;
        let mut members = Vec::new();
        while self.except([TokenKind::RBrace]) {
            let name = self.consume(TokenKind::Identifier)?.text().to_owned();
            self.skip_attributes();
            let value = if self.take(TokenKind::Eq) {
                Some(self.parse_value(&[TokenKind::Comma, TokenKind::RBrace])?)
            } else {
                None
            };
            members.push(Enumerator { name, value });
            if !self.take(TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::RBrace)?;
        Ok(members)
    }

    fn parse_declarator(&mut self) -> Result<Declarator<'src, 'tok>> {
        let token = self.peek();
        let (mut ops, pack) = self.parse_ptr_ops();

        let mut declarator = if self.is(TokenKind::LParen) && self.is_grouping() {
            self.advance();
            let inner = self.parse_declarator()?;
            self.consume(TokenKind::RParen)?;
            inner
        } else if matches!(
            self.peek().kind,
            TokenKind::Identifier | TokenKind::ColonColon | TokenKind::Operator | TokenKind::Tilde
        ) {
            let token = self.peek();
            let (name, qualified) = self.parse_declarator_name()?;
            Declarator {
                name: Some(name),
                qualified,
                pack,
                token,
                ops: Vec::new(),
            }
        } else {
            Declarator {
                name: None,
                qualified: false,
                pack,
                token,
                ops: Vec::new(),
            }
        };

        let mut suffixes = Vec::new();
        loop {
            self.skip_attributes();
            if self.is(TokenKind::LBracket) {
                self.advance();
                let size = if self.is(TokenKind::RBracket) {
                    None
                } else {
                    Some(self.parse_value(&[TokenKind::RBracket])?)
                };
                self.consume(TokenKind::RBracket)?;
                suffixes.push(TypeOp::Array(size));
            } else if self.take(TokenKind::LParen) {
                let mut suffix = self.parse_params()?;
                self.parse_function_tail(&mut suffix)?;
                suffixes.push(TypeOp::Function(suffix));
            } else {
                break;
            }
        }

        ops.extend(suffixes.into_iter().rev());
        ops.append(&mut declarator.ops);
        declarator.ops = ops;
        Ok(declarator)
    }

    /// Parses pointer and reference operators. Also reports whether a pack
    /// expansion (`...`) was seen.
    fn parse_ptr_ops(&mut self) -> (Vec<TypeOp>, bool) {
        let mut ops = Vec::new();
        let mut pack = false;
        loop {
            self.skip_attributes();
            let c = self.peek();
            match c.kind {
                TokenKind::Star => {
                    self.advance();
                    let qualifiers = self.parse_cv();
                    ops.push(TypeOp::Pointer(qualifiers));
                    continue;
                }
                TokenKind::Amp => ops.push(TypeOp::Reference),
                TokenKind::AmpAmp => ops.push(TypeOp::RValueReference),
                TokenKind::Ellipsis => pack = true,
                TokenKind::Identifier if is_calling_convention(c.text()) => {}
                _ => break (ops, pack),
            }
            self.advance();
        }
    }

    fn parse_cv(&mut self) -> Qualifiers {
        let mut qualifiers = Qualifiers::default();
        loop {
            match self.peek().kind {
                TokenKind::Const => qualifiers.is_const = true,
                TokenKind::Volatile => qualifiers.is_volatile = true,
                TokenKind::Restrict => {}
                _ => break qualifiers,
            }
            self.advance();
        }
    }

    /// Whether the `(` at the cursor opens a nested declarator, as in
    /// `void (*callback)(int)`, rather than a parameter list.
    fn is_grouping(&self) -> bool {
        let next = self.nth(1);
        match next.kind {
            TokenKind::Star | TokenKind::Amp | TokenKind::AmpAmp | TokenKind::AttributeKeyword => {
                true
            }
            TokenKind::Identifier => is_calling_convention(next.text()),
            _ => false,
        }
    }

    fn parse_declarator_name(&mut self) -> Result<(DeclName, bool)> {
        let mut qualified = self.take(TokenKind::ColonColon);
        loop {
            let c = self.peek();
            match c.kind {
                TokenKind::Operator => {
                    self.advance();
                    return Ok((self.parse_operator_name()?, qualified));
                }
                TokenKind::Tilde => {
                    self.advance();
                    let name = self.consume(TokenKind::Identifier)?.text().to_owned();
                    return Ok((DeclName::Destructor(name), qualified));
                }
                TokenKind::Identifier => {
                    self.advance();
                    if self.is(TokenKind::Less) {
                        // `Container<T>::size` or `swap<int>(...)`.
                        let _ = self.speculate(|p| p.parse_template_args());
                    }
                    if self.is(TokenKind::ColonColon)
                        && matches!(
                            self.nth(1).kind,
                            TokenKind::Identifier | TokenKind::Operator | TokenKind::Tilde
                        )
                    {
                        self.advance();
                        qualified = true;
                        continue;
                    }
                    return Ok((DeclName::Plain(c.text().to_owned()), qualified));
                }
                _ => return self.fail_here(Error::ExpectedName),
            }
        }
    }

    /// Parses what follows `operator`.
    fn parse_operator_name(&mut self) -> Result<DeclName> {
        use TokenKind::*;
        let c = self.peek();
        let op = match c.kind {
            LParen => {
                self.advance();
                self.consume(RParen)?;
                "()".to_owned()
            }
            LBracket => {
                self.advance();
                self.consume(RBracket)?;
                "[]".to_owned()
            }
            Identifier if matches!(c.text(), "new" | "delete") => {
                self.advance();
                if self.is(LBracket) && self.nth(1).kind == RBracket {
                    self.advance();
                    self.advance();
                    format!(" {}[]", c.text())
                } else {
                    format!(" {}", c.text())
                }
            }
            k if is_overloadable(k) => {
                self.advance();
                let mut op = c.text().to_owned();
                let mut last = k;
                // `>>`, `>>=` and `<=>` are lexed as several tokens.
                while matches!(last, Greater | LessEq)
                    && matches!(self.peek().kind, Greater | GreaterEq)
                    && !self.peek().spaced
                {
                    let next = self.advance();
                    op.push_str(next.text());
                    last = next.kind;
                }
                op
            }
            _ => {
                let specs = self.parse_specifiers(None)?;
                let base = self.require_type(&specs)?;
                let (ops, _) = self.parse_ptr_ops();
                return Ok(DeclName::Conversion(apply(base, ops)));
            }
        };
        Ok(DeclName::Operator(format!("operator{op}")))
    }

    /// Parses a parameter list, after its `(`.
    fn parse_params(&mut self) -> Result<FunctionSuffix> {
        let mut suffix = FunctionSuffix::default();
        if self.is(TokenKind::Void) && self.nth(1).kind == TokenKind::RParen {
            self.advance();
        }
        while self.except([TokenKind::RParen]) {
            if self.take(TokenKind::Ellipsis) {
                suffix.variadic = true;
                break;
            }
            let specs = self.parse_specifiers(None)?;
            let base = self.require_type(&specs)?;
            let declarator = self.parse_declarator()?;
            let has_default = self.take(TokenKind::Eq);
            if has_default {
                self.skip_until(&[TokenKind::Comma, TokenKind::RParen]);
            }
            let name = match declarator.name {
                Some(DeclName::Plain(name)) => Some(name),
                _ => None,
            };
            suffix.params.push(Parameter {
                name,
                ty: apply(base, declarator.ops),
                has_default,
            });
            if !self.take(TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::RParen)?;
        Ok(suffix)
    }

    /// Parses the qualifiers following a parameter list.
    fn parse_function_tail(&mut self, suffix: &mut FunctionSuffix) -> Result<()> {
        loop {
            self.skip_attributes();
            let c = self.peek();
            match c.kind {
                TokenKind::Const => suffix.is_const = true,
                TokenKind::Volatile | TokenKind::Amp | TokenKind::AmpAmp => {}
                TokenKind::Identifier if matches!(c.text(), "noexcept" | "throw") => {
                    self.advance();
                    if self.is(TokenKind::LParen) {
                        self.skip_balanced();
                    }
                    continue;
                }
                TokenKind::Identifier if matches!(c.text(), "override" | "final") => {}
                TokenKind::Arrow => {
                    self.advance();
                    suffix.trailing = Some(self.parse_type()?);
                    continue;
                }
                _ => return Ok(()),
            }
            self.advance();
        }
    }

    /// Parses what may follow a declarator in a declaration: a bit width, an
    /// initializer, a pure specifier or a function body.
    fn parse_declarator_tail(&mut self, declarator: &Declarator<'_, '_>) -> Result<Tail> {
        use TokenKind::*;
        let mut tail = Tail::default();
        let is_function = declarator.is_function();
        self.skip_attributes();
        if !is_function && self.take(Colon) {
            tail.bit_width = Some(self.parse_value(&[Comma, Semicolon, Eq, LBrace])?);
        }

        if self.take(Eq) {
            let c = self.peek();
            if is_function && c.kind == Number && c.text() == "0" {
                tail.is_pure = true;
                self.advance();
            } else if is_function && matches!(c.text(), "default" | "delete") {
                self.advance();
            } else {
                self.skip_until(&[Comma, Semicolon]);
            }
        } else if is_function {
            if self.take(Colon) {
                // Constructor initializers.
                loop {
                    self.skip_until(&[LParen, LBrace]);
                    self.skip_balanced();
                    if !self.take(Comma) {
                        break;
                    }
                }
            }
            if self.is(LBrace) {
                self.skip_balanced();
                tail.has_body = true;
            }
        } else if self.is(LBrace) {
            self.skip_balanced();
        }
        Ok(tail)
    }

    fn parse_template_params(&mut self) -> Result<Vec<TemplateParam<Parsed>>> {
        use TokenKind::*;
        self.consume(Less)?;
        let mut params = Vec::new();
        while self.except([Greater]) {
            let param = match self.peek().kind {
                Typename | Class => {
                    self.advance();
                    let pack = self.take(Ellipsis);
                    let name = self.take_name();
                    let default = if self.take(Eq) {
                        Some(self.parse_type()?)
                    } else {
                        None
                    };
                    TemplateParam {
                        name,
                        kind: TemplateParamKind::Type { default },
                        pack,
                    }
                }
                Template => {
                    self.advance();
                    self.parse_template_params()?;
                    self.consume_any(&[Class, Typename])?;
                    let pack = self.take(Ellipsis);
                    let name = self.take_name();
                    let default = self.take(Eq).then(|| self.parse_literal());
                    TemplateParam {
                        name,
                        kind: TemplateParamKind::Template { default },
                        pack,
                    }
                }
                _ => {
                    let specs = self.parse_specifiers(None)?;
                    let base = self.require_type(&specs)?;
                    let declarator = self.parse_declarator()?;
                    let name = match declarator.name {
                        Some(DeclName::Plain(name)) => Some(name),
                        _ => None,
                    };
                    let default = self.take(Eq).then(|| self.parse_literal());
                    TemplateParam {
                        name,
                        kind: TemplateParamKind::NonType {
                            ty: apply(base, declarator.ops),
                            default,
                        },
                        pack: declarator.pack,
                    }
                }
            };
            params.push(param);
            if !self.take(Comma) {
                break;
            }
        }
        self.consume(Greater)?;
        Ok(params)
    }

    fn parse_template_args(&mut self) -> Result<Vec<TypeArg>> {
        self.consume(TokenKind::Less)?;
        let mut args = Vec::new();
        while self.except([TokenKind::Greater]) {
            args.push(self.parse_template_arg()?);
            self.take(TokenKind::Ellipsis);
            if !self.take(TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::Greater)?;
        Ok(args)
    }

    fn parse_template_arg(&mut self) -> Result<TypeArg> {
        use TokenKind as T;
        let k = self.peek().kind;
        let starts_type = k.is_primitive()
            || matches!(
                k,
                T::Const
                    | T::Volatile
                    | T::Struct
                    | T::Class
                    | T::Union
                    | T::Enum
                    | T::Typename
                    | T::Identifier
                    | T::ColonColon
            );
        if starts_type {
            let ty = self.speculate(|p| {
                let ty = p.parse_type()?;
                if matches!(p.peek().kind, T::Comma | T::Greater | T::Ellipsis) {
                    Ok(ty)
                } else {
                    Err(())
                }
            });
            if let Some(ty) = ty {
                return Ok(TypeArg::Type(ty));
            }
        }

        let start = self.cursor;
        self.skip_until(&[T::Comma, T::Greater]);
        if self.cursor == start {
            return self.fail_here(Error::ExpectedType);
        }
        Ok(TypeArg::Literal(spell(&self.tokens[start..self.cursor])))
    }

    /// Parses a type with an abstract declarator, such as `const char *`.
    fn parse_type(&mut self) -> Result<TypeExpr> {
        let specs = self.parse_specifiers(None)?;
        let base = self.require_type(&specs)?;
        let declarator = self.parse_declarator()?;
        if declarator.name.is_some() {
            return self.fail(declarator.token, Error::UnexpectedName);
        }
        Ok(apply(base, declarator.ops))
    }

    fn parse_path(&mut self) -> Result<Path> {
        let absolute = self.take(TokenKind::ColonColon);
        let mut segments = Vec::new();
        loop {
            self.take(TokenKind::Template);
            let name = self.consume(TokenKind::Identifier)?.text().to_owned();
            let args = if self.is(TokenKind::Less) {
                Some(self.parse_template_args()?)
            } else {
                None
            };
            segments.push(PathSegment { name, args });
            if self.is(TokenKind::ColonColon)
                && matches!(self.nth(1).kind, TokenKind::Identifier | TokenKind::Template)
            {
                self.advance();
            } else {
                break;
            }
        }
        Ok(Path { absolute, segments })
    }

    /// Parses tokens up to one of `stops` as an integer, or keeps them as
    /// expression text.
    fn parse_value(&mut self, stops: &[TokenKind]) -> Result<Value> {
        let start = self.cursor;
        self.skip_until(stops);
        if self.cursor == start {
            let c = self.peek();
            return self.fail(c, Error::UnexpectedToken { token: c.kind });
        }
        Ok(value_of(&self.tokens[start..self.cursor]))
    }

    /// Takes the source text up to the next `,` or `>` of a template
    /// parameter list.
    fn parse_literal(&mut self) -> String {
        let start = self.cursor;
        self.skip_until(&[TokenKind::Comma, TokenKind::Greater]);
        spell(&self.tokens[start..self.cursor])
    }

    fn take_name(&mut self) -> Option<String> {
        self.is(TokenKind::Identifier)
            .then(|| self.advance().text().to_owned())
    }

    fn require_type(&mut self, specs: &Specifiers) -> Result<TypeExpr> {
        match specs.ty() {
            Some(ty) => Ok(ty),
            None => self.fail_here(Error::ExpectedType),
        }
    }

    /// Reports the declaration from `start` to the cursor, which is
    /// well-formed but has no counterpart in the model.
    fn unmodeled(&mut self, start: usize, what: &'static str) {
        let tokens = self.tokens;
        let first = &tokens[start.min(tokens.len() - 1)];
        let text = quote(&tokens[start..self.cursor.max(start)]);
        self.errors.push(first.wrap(Error::Unmodeled { what, text }));
    }

    fn unsupported_macro<T>(&mut self) -> Result<T> {
        let start = self.cursor;
        let name = self.advance();
        if self.is(TokenKind::LParen) {
            self.skip_balanced();
        }
        self.macro_span = (start, self.cursor);
        self.fail(
            name,
            Error::UnsupportedMacro {
                name: name.text().to_owned(),
            },
        )
    }
}

/// Recovery.
impl<'src, 'tok> Parser<'src, 'tok> {
    /// Skips the declaration starting at `start` and reports it.
    fn recover(&mut self, start: usize) {
        let tokens = self.tokens;
        let first = &tokens[start.min(tokens.len() - 1)];
        match self.reason.take() {
            Some(reason @ Spanned {
                inner: Error::UnsupportedMacro { .. },
                ..
            }) => {
                let (macro_start, macro_end) = self.macro_span;
                let next = &tokens[macro_end.min(tokens.len() - 1)];
                let alone = next.line_start
                    || matches!(
                        next.kind,
                        TokenKind::Semicolon | TokenKind::RBrace | TokenKind::Eof
                    );
                if macro_start == start && alone {
                    // An invocation on a line of its own.
                    self.cursor = macro_end;
                    self.take(TokenKind::Semicolon);
                } else {
                    self.cursor = start;
                    self.skip_declaration();
                }
                if self.cursor == start {
                    self.advance();
                }
                self.errors.push(reason);
            }
            reason => {
                self.cursor = start;
                self.skip_declaration();
                if self.cursor == start {
                    self.advance();
                }
                let text = quote(&tokens[start..self.cursor]);
                self.errors.push(first.wrap(Error::SkippedDeclaration {
                    text,
                    reason: reason.map(|r| Box::new(r.inner)),
                }));
            }
        }
    }

    /// Skips to the end of the current declaration: past the next `;` at
    /// the current nesting level, or past a closing brace which is not
    /// followed by declarators. Stops before a closer of an enclosing level.
    fn skip_declaration(&mut self) {
        use TokenKind::*;
        let mut depth = 0usize;
        loop {
            match self.peek().kind {
                Eof => break,
                LParen | LBracket | LBrace => depth += 1,
                RParen | RBracket if depth == 0 => break,
                RParen | RBracket => depth -= 1,
                RBrace if depth == 0 => break,
                RBrace => {
                    depth -= 1;
                    if depth == 0 {
                        self.advance();
                        // Declarators may follow a skipped definition, as in
                        // `struct { ... } x;`.
                        let next = self.peek();
                        let declarators = next.kind == Semicolon
                            || (matches!(next.kind, Identifier | Star | Amp) && !next.line_start);
                        if !declarators {
                            break;
                        }
                        continue;
                    }
                }
                Semicolon if depth == 0 => {
                    self.advance();
                    break;
                }
                _ => {}
            }
            self.advance();
        }
    }

    /// Skips to one of `stops` at the current nesting level, without
    /// consuming it.
    fn skip_until(&mut self, stops: &[TokenKind]) {
        use TokenKind::*;
        let mut depth = 0usize;
        loop {
            let c = self.peek().kind;
            match c {
                Eof => break,
                _ if depth == 0 && stops.contains(&c) => break,
                LParen | LBracket | LBrace => depth += 1,
                RParen | RBracket | RBrace if depth == 0 => break,
                RParen | RBracket | RBrace => depth -= 1,
                _ => {}
            }
            self.advance();
        }
    }

    /// Skips a balanced group, starting at its opening token.
    fn skip_balanced(&mut self) {
        use TokenKind::*;
        let mut depth = 0usize;
        loop {
            match self.advance().kind {
                LParen | LBracket | LBrace => depth += 1,
                RParen | RBracket | RBrace => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        break;
                    }
                }
                Eof => break,
                _ if depth == 0 => break,
                _ => {}
            }
        }
    }

    /// Skips GNU and Microsoft attributes, `[[...]]` attributes, `alignas`
    /// and assembler labels.
    fn skip_attributes(&mut self) {
        loop {
            let c = self.peek();
            match c.kind {
                TokenKind::AttributeKeyword => {}
                TokenKind::Identifier
                    if matches!(c.text(), "__asm__" | "__asm" | "__extension__") => {}
                TokenKind::LBracket if self.nth(1).kind == TokenKind::LBracket => {
                    self.skip_balanced();
                    continue;
                }
                _ => break,
            }
            self.advance();
            if self.is(TokenKind::LParen) {
                self.skip_balanced();
            }
        }
    }

    /// Runs `f`, restoring the parser state if it fails.
    fn speculate<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Option<T> {
        let cursor = self.cursor;
        let reason = self.reason.clone();
        let errors = self.errors.len();
        match f(self) {
            Ok(value) => Some(value),
            Err(()) => {
                self.cursor = cursor;
                self.reason = reason;
                self.errors.truncate(errors);
                None
            }
        }
    }
}

/// Token helpers.
impl<'src, 'tok> Parser<'src, 'tok> {
    /// Records the error as the reason the current declaration failed, unless
    /// one was already recorded.
    fn fail<T>(&mut self, token: &Token<'src>, error: Error) -> Result<T> {
        if self.reason.is_none() {
            self.reason = Some(token.wrap(error));
        }
        Err(())
    }

    fn fail_here<T>(&mut self, error: Error) -> Result<T> {
        let c = self.peek();
        self.fail(c, error)
    }

    fn origin(&self) -> Origin {
        self.peek().loc.into()
    }

    /// Returns the current token. The cursor never moves past the final
    /// [`TokenKind::Eof`].
    fn peek(&self) -> &'tok Token<'src> {
        self.nth(0)
    }

    fn nth(&self, n: usize) -> &'tok Token<'src> {
        let tokens = self.tokens;
        &tokens[(self.cursor + n).min(tokens.len() - 1)]
    }

    /// Returns the current token and advances.
    fn advance(&mut self) -> &'tok Token<'src> {
        let c = self.peek();
        if !c.is_eof() {
            self.cursor += 1;
        }
        c
    }

    /// Checks whether the current token matches the given one.
    fn is(&self, expect: TokenKind) -> bool {
        self.peek().kind == expect
    }

    /// Checks for an identifier with special meaning in some positions, such
    /// as `final`.
    fn is_contextual(&self, word: &str) -> bool {
        let c = self.peek();
        c.kind == TokenKind::Identifier && c.text() == word
    }

    /// Advances if the current token matches the provided one, returning true.
    /// If not, returns false and doesn't advance.
    fn take(&mut self, expect: TokenKind) -> bool {
        if self.is(expect) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Advances if the current token matches the provided one. If not,
    /// records an error.
    fn consume(&mut self, expect: TokenKind) -> Result<&'tok Token<'src>> {
        let c = self.peek();
        if c.kind == expect {
            self.advance();
            Ok(c)
        } else {
            self.fail(
                c,
                Error::Unexpected {
                    actual: c.kind,
                    expected: expect,
                },
            )
        }
    }

    /// Advances if the current token matches any of the provided tokens. If
    /// not, records an error.
    fn consume_any(&mut self, expect: &'static [TokenKind]) -> Result<&'tok Token<'src>> {
        let c = self.peek();
        if expect.contains(&c.kind) {
            self.advance();
            return Ok(c);
        }
        self.fail(
            c,
            Error::UnexpectedAny {
                actual: c.kind,
                expected: Box::from(expect),
            },
        )
    }

    /// Returns true while the current token does *not* match one of the
    /// provided ones. [`TokenKind::Eof`] is implicitly included in the list.
    ///
    /// This won't advance the cursor.
    fn except(&self, except: impl IntoIterator<Item = TokenKind>) -> bool {
        let c = self.peek().kind;
        c != TokenKind::Eof && except.into_iter().all(|e| e != c)
    }
}

struct FunctionParts<'src, 'tok> {
    name: DeclName,
    token: &'tok Token<'src>,
    suffix: FunctionSuffix,
    base: Option<TypeExpr>,
    ops: Vec<TypeOp>,
}

fn apply(base: TypeExpr, ops: Vec<TypeOp>) -> TypeExpr {
    ops.into_iter().fold(base, |ty, op| match op {
        TypeOp::Pointer(qualifiers) => {
            TypeExpr::qualified(qualifiers, TypeExpr::Pointer(Box::new(ty)))
        }
        TypeOp::Reference => TypeExpr::Reference(Box::new(ty)),
        TypeOp::RValueReference => TypeExpr::RValueReference(Box::new(ty)),
        TypeOp::Array(size) => TypeExpr::Array(Box::new(ty), size),
        TypeOp::Function(suffix) => TypeExpr::Function(Box::new(suffix.into_signature(ty))),
    })
}

/// Combines arithmetic type keywords into the type they name.
fn primitive(words: &[TokenKind]) -> Option<Primitive> {
    use TokenKind as T;
    if words.is_empty() {
        return None;
    }
    let has = |kind| words.contains(&kind);
    let longs = words.iter().filter(|&&k| k == T::Long).count();
    let unsigned = has(T::Unsigned);
    let primitive = if has(T::Void) {
        Primitive::Void
    } else if has(T::Bool) {
        Primitive::Bool
    } else if has(T::Float) {
        Primitive::Float
    } else if has(T::Double) {
        if longs > 0 {
            Primitive::LongDouble
        } else {
            Primitive::Double
        }
    } else if has(T::Char) {
        if unsigned {
            Primitive::UnsignedChar
        } else if has(T::Signed) {
            Primitive::SignedChar
        } else {
            Primitive::Char
        }
    } else if has(T::Short) {
        if unsigned {
            Primitive::UnsignedShort
        } else {
            Primitive::Short
        }
    } else if longs >= 2 {
        if unsigned {
            Primitive::UnsignedLongLong
        } else {
            Primitive::LongLong
        }
    } else if longs == 1 {
        if unsigned {
            Primitive::UnsignedLong
        } else {
            Primitive::Long
        }
    } else if unsigned {
        Primitive::UnsignedInt
    } else {
        Primitive::Int
    };
    Some(primitive)
}

fn value_of(tokens: &[Token<'_>]) -> Value {
    use TokenKind::*;
    let int = match tokens {
        [t] if t.kind == Number => extract::int(t.text()),
        [t] if t.kind == CharLiteral => extract::char(t.text()),
        [sign, t] if sign.kind == Minus && t.kind == Number => {
            extract::int(t.text()).and_then(i64::checked_neg)
        }
        [sign, t] if sign.kind == Plus && t.kind == Number => extract::int(t.text()),
        _ => None,
    };
    int.map_or_else(|| Value::Expr(spell(tokens)), Value::Int)
}

fn quote(tokens: &[Token<'_>]) -> String {
    let text = spell(tokens);
    match text.char_indices().nth(MAX_QUOTED_LEN) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text,
    }
}

fn is_calling_convention(word: &str) -> bool {
    matches!(
        word,
        "__cdecl" | "__stdcall" | "__fastcall" | "__thiscall" | "__vectorcall"
    )
}

/// Specifier words with no bearing on the declaration model.
fn is_ignored_specifier(word: &str) -> bool {
    matches!(
        word,
        "_Noreturn"
            | "__forceinline"
            | "thread_local"
            | "_Thread_local"
            | "__thread"
            | "consteval"
            | "constinit"
    ) || is_calling_convention(word)
}

fn is_overloadable(kind: TokenKind) -> bool {
    use TokenKind::*;
    matches!(
        kind,
        Plus | Minus
            | Star
            | Slash
            | Percent
            | Caret
            | Amp
            | Pipe
            | Tilde
            | Bang
            | Eq
            | Less
            | Greater
            | OpAssign
            | LessLess
            | EqEq
            | NotEq
            | LessEq
            | GreaterEq
            | AmpAmp
            | PipePipe
            | PlusPlus
            | MinusMinus
            | Comma
            | Arrow
    )
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    Unexpected {
        actual: TokenKind,
        expected: TokenKind,
    },
    UnexpectedAny {
        actual: TokenKind,
        expected: Box<[TokenKind]>,
    },
    UnexpectedToken {
        token: TokenKind,
    },
    ExpectedType,
    ExpectedName,
    /// A name where an abstract declarator was expected.
    UnexpectedName,
    /// A declaration the parser gave up on. It was skipped.
    SkippedDeclaration {
        /// The skipped source text, possibly shortened.
        text: String,
        reason: Option<Box<Error>>,
    },
    /// An unknown macro in declaration position. The declaration was
    /// skipped.
    UnsupportedMacro {
        name: String,
    },
    /// A well-formed declaration with no counterpart in the model, such as
    /// an alias template. It was skipped.
    Unmodeled {
        what: &'static str,
        text: String,
    },
}

impl Error {
    pub fn diagnostic_kind(&self) -> DiagnosticKind {
        match self {
            Error::UnsupportedMacro { .. } => DiagnosticKind::UnsupportedMacro,
            Error::Unmodeled { .. } => DiagnosticKind::UnmodeledDeclaration,
            _ => DiagnosticKind::SkippedDeclaration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::parse_unit;
    use crate::{
        lexer,
        util::test_utils::{tree_tests, TEST_FILE},
    };
    use pretty_assertions::assert_eq;

    tree_tests!(
        use parser;

        fn test_anonymous_struct_takes_typedef_name() {
            let header = "typedef struct { int width; int height; } Size;";
            let tree_ok = "
                struct Size (typedef)
                  field width: int
                  field height: int
            ";
        }

        fn test_tagged_struct_with_distinct_typedef() {
            let header = "typedef struct _Node { struct _Node *next; } Node, *NodeRef;";
            let tree_ok = "
                struct _Node
                  field next: struct _Node *
                typedef Node = struct _Node
                typedef NodeRef = struct _Node *
            ";
        }

        fn test_function_pointer_typedef() {
            let header = "typedef void (*Callback)(void *user_data);";
            let tree_ok = "
                typedef Callback = void(void *) *
            ";
        }

        fn test_variadic_function() {
            let header = "void log_printf(enum LogLevel level, const char *fmt, ...);";
            let tree_ok = "
                function log_printf(level: enum LogLevel, fmt: const char *, ...) -> void
            ";
        }

        fn test_enums() {
            let header = "
                enum Color { RED, GREEN = 2, BLUE = GREEN + 1, };
                typedef enum { LOW = -1, HIGH } Level;
                enum class Mode : unsigned char { A = 'a' };
                enum Forward : int;
            ";
            let tree_ok = "
                enum Color : int
                  RED
                  GREEN = 2
                  BLUE = GREEN + 1
                enum Level : int (typedef)
                  LOW = -1
                  HIGH
                enum class Mode : unsigned char
                  A = 97
                enum Forward : int (incomplete)
            ";
        }

        fn test_class_members() {
            let header = "
                class Shape : public Base, private virtual Other {
                public:
                    Shape();
                    virtual ~Shape();
                    virtual double area() const = 0;
                    static int count;
                    bool operator==(const Shape &other) const;
                    explicit operator bool() const { return true; }
                protected:
                    int sides : 4;
                };
            ";
            let tree_ok = "
                class Shape
                  base public Base
                  base private virtual Other
                  field count: int [static]
                  field sides: int : 4 [protected]
                  constructor Shape() -> void
                  destructor ~Shape() -> void [virtual]
                  method area() -> double [virtual, pure, const]
                  operator operator==(other: const Shape &) -> bool [const]
                  conversion operator bool() -> bool [const, explicit]
            ";
        }

        fn test_class_defaults_to_private() {
            let header = "
                class Counter {
                    int value;
                public:
                    int get() const;
                };
                struct Open { int value; };
            ";
            let tree_ok = "
                class Counter
                  field value: int [private]
                  method get() -> int [const]
                struct Open
                  field value: int
            ";
        }

        fn test_templates_and_specializations() {
            let header = "
                namespace adsk { namespace core {
                template <typename T, int N = 4>
                class Container {
                public:
                    T items[N];
                    typedef T value_type;
                    T get(int index) const;
                };
                template <> class Container<int> { public: int total; };
                template <typename T> class Container<T *> { public: T *first; };
                } }
            ";
            let tree_ok = "
                namespace adsk
                  namespace core
                    template <typename T, int N = 4> class Container
                      field items: T[N]
                      method get(index: int) -> T [const]
                      typedef value_type = T
                    specialization Container<int>
                      field total: int
                    specialization <typename T> Container<T *>
                      field first: T *
            ";
        }

        fn test_function_template() {
            let header = "
                template <typename T>
                T max_of(const T &a, const T &b);
            ";
            let tree_ok = "
                template <typename T> function max_of(a: const T &, b: const T &) -> T
            ";
        }

        fn test_bodies_and_out_of_line_definitions_are_skipped() {
            let header = "
                struct P { P(int v) : value(v), cache{0} {} int value; int cache; };
                P::P(int v) : value(v) {}
                inline int twice(int x) { return x * 2; }
                int P::count = 0;
            ";
            let tree_ok = "
                struct P
                  field value: int
                  field cache: int
                  constructor P(v: int) -> void
                function twice(x: int) -> int [inline]
            ";
        }

        fn test_record_members_of_every_shape() {
            let header = "
                struct Event {
                    int kind;
                    union { int code; float value; };
                    char name[16];
                    char data[];
                    void (*handler)(struct Event *event, int flags);
                };
            ";
            let tree_ok = "
                struct Event
                  field kind: int
                  field <anonymous>: union
                    field code: int
                    field value: float
                  field name: char[16]
                  field data: char[]
                  field handler: void(struct Event *, int) *
            ";
        }

        fn test_linkage_blocks_and_aliases() {
            let header = r#"
                extern "C" {
                extern int debug_level;
                typedef unsigned long long u64;
                }
                namespace {
                using Handle = void *;
                }
            "#;
            let tree_ok = "
                variable debug_level: int [extern]
                typedef u64 = unsigned long long
                namespace <anonymous>
                  typedef Handle = void *
            ";
        }

        fn test_attributes_are_ignored() {
            let header = "
                struct __attribute__((packed)) Packed { int a; } __attribute__((aligned(4)));
                [[nodiscard]] int checked(void) __attribute__((warn_unused_result));
                __declspec(dllexport) void exported(int count = 3);
            ";
            let tree_ok = "
                struct Packed
                  field a: int
                function checked() -> int
                function exported(count: int = ...) -> void
            ";
        }

        fn test_unrecognized_declarations_are_skipped() {
            let header = "int good;\nint bad(int x y);\nstruct S {\n    int x;\n    int z w;\n    int y;\n};\nint after;\n";
            let tree_error = "
                variable good: int
                struct S
                  field x: int
                  field y: int
                variable after: int
            ";
            let expected_errors = &[
                "test.h:2:1: skipped declaration `int bad(int x y);`: expected token RParen, but got Identifier",
                "test.h:5:5: skipped declaration `int z w;`: expected token Semicolon, but got Identifier",
            ];
        }

        fn test_unknown_macros_in_declaration_position() {
            let header = "DECLARE_HANDLE(Window);\nCORE_API void init(void);\nvoid ok(void);\n";
            let tree_error = "
                function ok() -> void
            ";
            let expected_errors = &[
                "test.h:1:1: unsupported macro `DECLARE_HANDLE` in declaration position",
                "test.h:2:1: unsupported macro `CORE_API` in declaration position",
            ];
        }

        fn test_unmodeled_templates_are_reported() {
            let header = "
                template <typename T> using Vec = Array<T>;
                template <typename T> constexpr T zero = T();
                class Box {
                    template <typename U> friend class Other;
                    int size;
                };
            ";
            let tree_error = "
                class Box
                  field size: int [private]
            ";
            let expected_errors = &[
                "test.h:1:1: alias template `template <typename T> using Vec = Array<T>;` is not modeled",
                "test.h:2:35: variable template `zero` is not modeled",
                "test.h:4:5: template friend `template <typename U> friend class Other;` is not modeled",
            ];
        }
    );

    #[test]
    fn items_are_located_where_their_declaration_starts() {
        let header = "static int a,\n  b;\ntemplate <>\nstruct Traits<int> {};\n  typedef struct { int x; } S;\n";
        let tokens = lexer::lex_in_new(TEST_FILE, header);
        let Ok(unit) = parse_unit(&tokens) else {
            panic!("unexpected parse errors");
        };
        let origins: Vec<_> = unit
            .items
            .iter()
            .map(|item| (item.origin.line, item.origin.column))
            .collect();
        assert_eq!(origins, [(1, 1), (1, 1), (3, 1), (5, 3)]);
    }
}
