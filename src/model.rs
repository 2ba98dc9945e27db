//! The declaration model: the language-neutral representation of everything
//! extracted from a set of headers.
//!
//! Declarations are generic over a [`Phase`]. The parser produces
//! [`Parsed`] declarations, whose types are still unresolved syntax; the
//! resolver turns them into [`Resolved`] ones, whose types are [`TypeRef`]s.

use std::{collections::HashMap, fmt};

use serde::Serialize;

use crate::{
    ast,
    diagnostic::{Diagnostic, DiagnosticKind, Position},
    token::Location,
};

pub trait Phase {
    type Type: Clone + fmt::Debug + PartialEq + Serialize;
    type Arg: Clone + fmt::Debug + PartialEq + Serialize;
    type Name: Clone + fmt::Debug + PartialEq + Serialize;
}

/// Declarations as written, with unresolved types.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum Parsed {}

/// Declarations whose types were bound by the resolver.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum Resolved {}

impl Phase for Parsed {
    type Type = ast::TypeExpr;
    type Arg = ast::TypeArg;
    type Name = ast::Path;
}

impl Phase for Resolved {
    type Type = TypeRef;
    type Arg = TypeArg;
    type Name = String;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    Public,
    Protected,
    Private,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Access::Public => "public",
            Access::Protected => "protected",
            Access::Private => "private",
        })
    }
}

/// An integer, or an expression kept as source text (such as `SIZE * 2`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Expr(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(int) => write!(f, "{int}"),
            Value::Expr(expr) => f.write_str(expr),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum ConstValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for ConstValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstValue::Int(int) => write!(f, "{int}"),
            ConstValue::Float(float) => write!(f, "{float:?}"),
            ConstValue::Str(s) => write!(f, "{s:?}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Field<P: Phase = Resolved> {
    /// `None` for anonymous struct or union members.
    pub name: Option<String>,
    pub ty: P::Type,
    pub bit_width: Option<Value>,
    pub access: Access,
    /// Layout position among the record's fields.
    pub ordinal: usize,
    pub is_static: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Parameter<P: Phase = Resolved> {
    pub name: Option<String>,
    pub ty: P::Type,
    /// Whether a default argument is present. Its value is not recorded.
    pub has_default: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Signature<P: Phase = Resolved> {
    pub return_ty: P::Type,
    pub params: Vec<Parameter<P>>,
    pub variadic: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionKind {
    Free,
    Method,
    Constructor,
    Destructor,
    Operator,
    Conversion,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub struct FunctionQualifiers {
    pub is_virtual: bool,
    /// `= 0`.
    pub is_pure: bool,
    pub is_const: bool,
    pub is_static: bool,
    pub is_inline: bool,
    pub is_extern: bool,
    pub is_explicit: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FunctionDecl<P: Phase = Resolved> {
    /// The unqualified name, such as `draw` or `operator==`.
    pub name: String,
    pub kind: FunctionKind,
    pub signature: Signature<P>,
    pub qualifiers: FunctionQualifiers,
    pub access: Access,
    /// Non-empty for function templates.
    pub template_params: Vec<TemplateParam<P>>,
    /// The qualified name of the enclosing scope (empty for the global
    /// scope).
    pub scope: String,
}

impl<P: Phase> FunctionDecl<P> {
    pub fn qualified_name(&self) -> String {
        qualify(&self.scope, &self.name)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Struct,
    Class,
    Union,
}

impl RecordKind {
    /// The member access that applies before any access specifier.
    pub fn default_access(self) -> Access {
        match self {
            RecordKind::Class => Access::Private,
            RecordKind::Struct | RecordKind::Union => Access::Public,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecordKind::Struct => "struct",
            RecordKind::Class => "class",
            RecordKind::Union => "union",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BaseSpec<P: Phase = Resolved> {
    pub name: P::Name,
    pub access: Access,
    pub is_virtual: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RecordDecl<P: Phase = Resolved> {
    pub name: Option<String>,
    pub kind: RecordKind,
    pub fields: Vec<Field<P>>,
    pub methods: Vec<FunctionDecl<P>>,
    pub bases: Vec<BaseSpec<P>>,
    /// `false` for forward declarations.
    pub complete: bool,
    /// Whether the name was given by a `typedef` (as in
    /// `typedef struct { ... } Size;`).
    pub typedef_name: bool,
}

impl<P: Phase> RecordDecl<P> {
    pub fn forward(name: impl Into<String>, kind: RecordKind) -> Self {
        RecordDecl {
            name: Some(name.into()),
            kind,
            fields: Vec::new(),
            methods: Vec::new(),
            bases: Vec::new(),
            complete: false,
            typedef_name: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Enumerator {
    pub name: String,
    pub value: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EnumDecl<P: Phase = Resolved> {
    pub name: Option<String>,
    /// `enum class` or `enum struct`.
    pub scoped: bool,
    pub underlying: P::Type,
    pub members: Vec<Enumerator>,
    pub complete: bool,
    pub typedef_name: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TypedefDecl<P: Phase = Resolved> {
    pub name: String,
    pub ty: P::Type,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VariableDecl<P: Phase = Resolved> {
    pub name: String,
    pub ty: P::Type,
    pub is_extern: bool,
    pub is_static: bool,
}

/// An object-like macro whose body is a literal.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConstantDecl {
    pub name: String,
    pub value: ConstValue,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum TemplateParamKind<P: Phase = Resolved> {
    /// `typename T = Default`.
    Type { default: Option<P::Type> },
    /// `int N = 4`. The default is kept as source text.
    NonType { ty: P::Type, default: Option<String> },
    /// `template <typename> class C`.
    Template { default: Option<String> },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TemplateParam<P: Phase = Resolved> {
    pub name: Option<String>,
    pub kind: TemplateParamKind<P>,
    /// `typename... Ts`.
    pub pack: bool,
}

/// A primary class template.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TemplateDecl<P: Phase = Resolved> {
    pub params: Vec<TemplateParam<P>>,
    pub record: RecordDecl<P>,
}

/// A full or partial specialization of a class template. It is
/// self-contained: no members are inherited from the primary template.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SpecializationDecl<P: Phase = Resolved> {
    /// The (qualified, once resolved) name of the primary template.
    pub template: String,
    /// Empty for full specializations.
    pub params: Vec<TemplateParam<P>>,
    pub args: Vec<P::Arg>,
    pub record: RecordDecl<P>,
    /// Whether the primary template is unknown.
    pub orphaned: bool,
}

impl<P: Phase> SpecializationDecl<P> {
    pub fn is_partial(&self) -> bool {
        !self.params.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "decl", rename_all = "lowercase")]
pub enum Decl<P: Phase = Resolved> {
    Record(RecordDecl<P>),
    Enum(EnumDecl<P>),
    Typedef(TypedefDecl<P>),
    Function(FunctionDecl<P>),
    Variable(VariableDecl<P>),
    Constant(ConstantDecl),
    Template(TemplateDecl<P>),
    Specialization(SpecializationDecl<P>),
}

impl<P: Phase> Decl<P> {
    /// The declared name, if not anonymous.
    pub fn name(&self) -> Option<&str> {
        match self {
            Decl::Record(r) => r.name.as_deref(),
            Decl::Enum(e) => e.name.as_deref(),
            Decl::Typedef(t) => Some(&t.name),
            Decl::Function(f) => Some(&f.name),
            Decl::Variable(v) => Some(&v.name),
            Decl::Constant(c) => Some(&c.name),
            Decl::Template(t) => t.record.name.as_deref(),
            Decl::Specialization(s) => s.record.name.as_deref(),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Decl::Record(r) => match r.kind {
                RecordKind::Struct => "struct",
                RecordKind::Class => "class",
                RecordKind::Union => "union",
            },
            Decl::Enum(_) => "enum",
            Decl::Typedef(_) => "typedef",
            Decl::Function(_) => "function",
            Decl::Variable(_) => "variable",
            Decl::Constant(_) => "constant",
            Decl::Template(_) => "template",
            Decl::Specialization(_) => "specialization",
        }
    }
}

/// The builtin arithmetic types.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Primitive {
    Void,
    Bool,
    Char,
    SignedChar,
    UnsignedChar,
    Short,
    UnsignedShort,
    Int,
    UnsignedInt,
    Long,
    UnsignedLong,
    LongLong,
    UnsignedLongLong,
    Float,
    Double,
    LongDouble,
}

impl Primitive {
    pub fn as_str(self) -> &'static str {
        match self {
            Primitive::Void => "void",
            Primitive::Bool => "bool",
            Primitive::Char => "char",
            Primitive::SignedChar => "signed char",
            Primitive::UnsignedChar => "unsigned char",
            Primitive::Short => "short",
            Primitive::UnsignedShort => "unsigned short",
            Primitive::Int => "int",
            Primitive::UnsignedInt => "unsigned int",
            Primitive::Long => "long",
            Primitive::UnsignedLong => "unsigned long",
            Primitive::LongLong => "long long",
            Primitive::UnsignedLongLong => "unsigned long long",
            Primitive::Float => "float",
            Primitive::Double => "double",
            Primitive::LongDouble => "long double",
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub struct Qualifiers {
    pub is_const: bool,
    pub is_volatile: bool,
}

impl Qualifiers {
    pub const CONST: Qualifiers = Qualifiers {
        is_const: true,
        is_volatile: false,
    };

    pub fn is_empty(self) -> bool {
        !self.is_const && !self.is_volatile
    }

    #[must_use]
    pub fn union(self, other: Qualifiers) -> Qualifiers {
        Qualifiers {
            is_const: self.is_const || other.is_const,
            is_volatile: self.is_volatile || other.is_volatile,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NamedKind {
    Struct,
    Class,
    Union,
    Enum,
}

impl From<RecordKind> for NamedKind {
    fn from(kind: RecordKind) -> Self {
        match kind {
            RecordKind::Struct => NamedKind::Struct,
            RecordKind::Class => NamedKind::Class,
            RecordKind::Union => NamedKind::Union,
        }
    }
}

/// A resolved template argument.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum TypeArg {
    Type(TypeRef),
    /// A non-type argument, such as `4` or `N + 1`.
    Literal(String),
}

impl fmt::Display for TypeArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeArg::Type(ty) => write!(f, "{ty}"),
            TypeArg::Literal(literal) => f.write_str(literal),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Instantiation {
    /// The qualified name of the primary template.
    pub template: String,
    /// All arguments, including defaulted ones.
    pub args: Vec<TypeArg>,
    /// The arguments of the specialization selected for these arguments,
    /// if any. `None` means the primary template's members apply.
    pub specialization: Option<Vec<TypeArg>>,
}

/// A normalized reference to a type.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum TypeRef {
    Primitive(Primitive),
    /// A well-known library type (`size_t`, `FILE`, ...), which needs no
    /// declaration.
    Builtin(String),
    /// A record or enum, by qualified name.
    Named { name: String, kind: NamedKind },
    /// A typedef name, with its terminal (non-typedef) target.
    Alias { name: String, target: Box<TypeRef> },
    /// A template parameter, within its template.
    Param(String),
    /// A name depending on a template parameter, such as
    /// `typename Iterator::value_type`. It is never looked up.
    Dependent(String),
    Pointer(Box<TypeRef>),
    Reference(Box<TypeRef>),
    RValueReference(Box<TypeRef>),
    Array(Box<TypeRef>, Option<Value>),
    FunctionPointer(Box<Signature>),
    /// A function type which is not behind a pointer, such as the target of
    /// `typedef void handler_fn(int);`.
    Function(Box<Signature>),
    Instantiation(Box<Instantiation>),
    Qualified(Qualifiers, Box<TypeRef>),
    /// A record defined inline without a name, such as the type of `u` in
    /// `union { int i; float f; } u;`.
    AnonymousRecord(Box<RecordDecl>),
    AnonymousEnum(Box<EnumDecl>),
}

impl TypeRef {
    /// Strips aliases and qualifiers down to the underlying type.
    pub fn terminal(&self) -> &TypeRef {
        match self {
            TypeRef::Alias { target, .. } => target.terminal(),
            TypeRef::Qualified(_, inner) => inner.terminal(),
            other => other,
        }
    }

    pub fn unqualified(&self) -> &TypeRef {
        match self {
            TypeRef::Qualified(_, inner) => inner,
            other => other,
        }
    }

    pub fn qualified(qualifiers: Qualifiers, ty: TypeRef) -> TypeRef {
        if qualifiers.is_empty() {
            return ty;
        }
        match ty {
            TypeRef::Qualified(inner_qualifiers, inner) => {
                TypeRef::Qualified(qualifiers.union(inner_qualifiers), inner)
            }
            ty => TypeRef::Qualified(qualifiers, Box::new(ty)),
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Primitive(p) => f.write_str(p.as_str()),
            TypeRef::Builtin(name)
            | TypeRef::Alias { name, .. }
            | TypeRef::Param(name)
            | TypeRef::Dependent(name) => f.write_str(name),
            TypeRef::Named { name, kind } => match kind {
                NamedKind::Enum => write!(f, "enum {name}"),
                NamedKind::Struct | NamedKind::Class | NamedKind::Union => f.write_str(name),
            },
            TypeRef::Pointer(inner) => write!(f, "{inner} *"),
            TypeRef::Reference(inner) => write!(f, "{inner} &"),
            TypeRef::RValueReference(inner) => write!(f, "{inner} &&"),
            TypeRef::Array(inner, Some(size)) => write!(f, "{inner}[{size}]"),
            TypeRef::Array(inner, None) => write!(f, "{inner}[]"),
            TypeRef::FunctionPointer(sig) => write_signature(f, sig, "(*)"),
            TypeRef::Function(sig) => write_signature(f, sig, ""),
            TypeRef::Instantiation(inst) => {
                write!(f, "{}<", inst.template)?;
                for (i, arg) in inst.args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(">")
            }
            TypeRef::Qualified(q, inner) => {
                if q.is_const {
                    f.write_str("const ")?;
                }
                if q.is_volatile {
                    f.write_str("volatile ")?;
                }
                write!(f, "{inner}")
            }
            TypeRef::AnonymousRecord(record) => write!(f, "{} {{...}}", record.kind),
            TypeRef::AnonymousEnum(_) => f.write_str("enum {...}"),
        }
    }
}

fn write_signature(f: &mut fmt::Formatter<'_>, sig: &Signature, declarator: &str) -> fmt::Result {
    write!(f, "{}", sig.return_ty)?;
    if !declarator.is_empty() {
        write!(f, " {declarator}")?;
    }
    f.write_str("(")?;
    for (i, param) in sig.params.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", param.ty)?;
    }
    if sig.variadic {
        f.write_str(if sig.params.is_empty() { "..." } else { ", ..." })?;
    }
    f.write_str(")")
}

/// Joins a scope path and a name.
pub fn qualify(scope: &str, name: &str) -> String {
    if scope.is_empty() {
        name.to_owned()
    } else {
        format!("{scope}::{name}")
    }
}

/// Splits a qualified name into its scope and last segment. Separators within
/// template arguments, as in `Ptr<std::string>`, are not split on.
pub fn split_scope(qualified: &str) -> (&str, &str) {
    let bytes = qualified.as_bytes();
    let mut depth = 0usize;
    let mut split = None;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'<' => depth += 1,
            b'>' => depth = depth.saturating_sub(1),
            b':' if depth == 0 && i > 0 && bytes[i - 1] == b':' => split = Some(i - 1),
            _ => {}
        }
    }
    match split {
        Some(i) => (&qualified[..i], &qualified[i + 2..]),
        None => ("", qualified),
    }
}

/// Where a declaration was found.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub struct Origin {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl Origin {
    pub fn position(&self) -> Position {
        Position {
            line: self.line,
            column: self.column,
        }
    }
}

impl From<Location<'_>> for Origin {
    fn from(loc: Location<'_>) -> Self {
        Origin {
            file: loc.file.to_owned(),
            line: loc.line,
            column: loc.column,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Item {
    pub decl: Decl,
    pub origin: Origin,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    Global,
    Namespace,
    /// Declarations nested in a record or template.
    Record,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct ScopeId(pub usize);

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Scope {
    /// The qualified path of the scope (empty for the global scope).
    pub path: String,
    pub kind: ScopeKind,
    pub parent: Option<ScopeId>,
    /// Declarations, in source order.
    pub items: Vec<Item>,
}

impl Scope {
    /// The last segment of the path.
    pub fn name(&self) -> &str {
        split_scope(&self.path).1
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct DeclRef {
    pub scope: ScopeId,
    pub item: usize,
}

/// The outcome of [`DeclarationModel::insert`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Insertion {
    Added(DeclRef),
    /// An identical declaration already existed.
    Duplicate(DeclRef),
    /// A forward declaration was replaced by its definition.
    Completed(DeclRef),
    /// A materially different declaration already existed, and was kept.
    Conflict { existing: DeclRef, previous: Origin },
}

/// The extracted declarations, in ordered scopes, plus a flat index from
/// qualified name to declarations.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeclarationModel {
    scopes: Vec<Scope>,
    #[serde(skip)]
    scope_index: HashMap<String, ScopeId>,
    #[serde(skip)]
    index: HashMap<String, Vec<DeclRef>>,
}

impl Default for DeclarationModel {
    fn default() -> Self {
        DeclarationModel::new()
    }
}

impl DeclarationModel {
    pub const GLOBAL: ScopeId = ScopeId(0);

    pub fn new() -> DeclarationModel {
        let global = Scope {
            path: String::new(),
            kind: ScopeKind::Global,
            parent: None,
            items: Vec::new(),
        };
        DeclarationModel {
            scopes: vec![global],
            scope_index: HashMap::from([(String::new(), DeclarationModel::GLOBAL)]),
            index: HashMap::new(),
        }
    }

    /// All scopes. The global scope comes first, and every scope comes after
    /// its parent.
    pub fn scopes(&self) -> &[Scope] {
        &self.scopes
    }

    pub fn global(&self) -> &Scope {
        &self.scopes[DeclarationModel::GLOBAL.0]
    }

    pub fn scope(&self, path: &str) -> Option<&Scope> {
        self.scope_index.get(path).map(|id| &self.scopes[id.0])
    }

    pub fn scope_by_id(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0]
    }

    pub fn item(&self, decl: DeclRef) -> &Item {
        &self.scopes[decl.scope.0].items[decl.item]
    }

    /// All declarations with the provided qualified name (several for
    /// overloads, or for a struct and a typedef sharing a name).
    pub fn lookup(&self, qualified_name: &str) -> impl Iterator<Item = &Item> + '_ {
        self.index
            .get(qualified_name)
            .into_iter()
            .flatten()
            .map(|r| self.item(*r))
    }

    /// The first declaration with the provided qualified name.
    pub fn get(&self, qualified_name: &str) -> Option<&Item> {
        self.lookup(qualified_name).next()
    }

    pub fn len(&self) -> usize {
        self.scopes.iter().map(|s| s.items.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the scope with the provided path, creating it (and its
    /// parents) if needed.
    pub fn scope_or_insert(&mut self, path: &str, kind: ScopeKind) -> ScopeId {
        if let Some(id) = self.scope_index.get(path) {
            return *id;
        }
        let parent = match split_scope(path) {
            ("", _) => DeclarationModel::GLOBAL,
            (parent, _) => self.scope_or_insert(parent, ScopeKind::Namespace),
        };
        let id = ScopeId(self.scopes.len());
        self.scopes.push(Scope {
            path: path.to_owned(),
            kind,
            parent: Some(parent),
            items: Vec::new(),
        });
        self.scope_index.insert(path.to_owned(), id);
        id
    }

    /// Inserts a declaration at the end of the provided scope, unless a
    /// declaration with the same identity already exists there.
    ///
    /// Identical redeclarations are dropped. A forward declaration followed
    /// by a definition is completed in place; the opposite order keeps the
    /// definition. Anything else is a conflict, and the first declaration
    /// wins.
    pub fn insert(&mut self, scope: ScopeId, item: Item) -> Insertion {
        let path = self.scopes[scope.0].path.clone();
        let qualified = item.decl.name().map(|name| qualify(&path, name));
        let identity = identity(&item.decl);

        if let (Some(qualified), Some(identity)) = (&qualified, &identity) {
            let existing = self.index.get(qualified).and_then(|refs| {
                refs.iter()
                    .copied()
                    .find(|r| self.item(*r).decl.name().is_some() && same_identity(&self.item(*r).decl, identity))
            });
            if let Some(existing) = existing {
                let slot = &mut self.scopes[existing.scope.0].items[existing.item];
                return match reconcile(&slot.decl, &item.decl) {
                    Reconciliation::Same => Insertion::Duplicate(existing),
                    Reconciliation::Replace => {
                        *slot = item;
                        Insertion::Completed(existing)
                    }
                    Reconciliation::Conflict => Insertion::Conflict {
                        existing,
                        previous: slot.origin.clone(),
                    },
                };
            }
        } else if let Some(identity) = &identity {
            // Anonymous enums are identified by their members.
            let items = &self.scopes[scope.0].items;
            if let Some(i) = items
                .iter()
                .position(|other| other.decl.name().is_none() && same_identity(&other.decl, identity))
            {
                let existing = DeclRef { scope, item: i };
                return match reconcile(&items[i].decl, &item.decl) {
                    Reconciliation::Same | Reconciliation::Replace => Insertion::Duplicate(existing),
                    Reconciliation::Conflict => Insertion::Conflict {
                        existing,
                        previous: items[i].origin.clone(),
                    },
                };
            }
        }

        let items = &mut self.scopes[scope.0].items;
        let decl_ref = DeclRef {
            scope,
            item: items.len(),
        };
        items.push(item);
        if let Some(qualified) = qualified {
            self.index.entry(qualified).or_default().push(decl_ref);
        }
        Insertion::Added(decl_ref)
    }

    /// Inserts a declaration, recording a diagnostic on conflicts.
    pub fn insert_reporting(&mut self, scope: ScopeId, item: Item, diagnostics: &mut Vec<Diagnostic>) {
        let name = item.decl.name().map(|name| qualify(&self.scopes[scope.0].path, name));
        let kind = item.decl.kind_name();
        let origin = item.origin.clone();
        if let Insertion::Conflict { previous, .. } = self.insert(scope, item) {
            let message = format!(
                "conflicting redeclaration of {kind} `{}` (first defined at {previous})",
                name.as_deref().unwrap_or("<anonymous>"),
            );
            diagnostics.push(Diagnostic::at(
                DiagnosticKind::ConflictingRedeclaration,
                origin.file.clone(),
                origin.position(),
                message,
            ));
        }
    }

    /// Merges another model into this one, scope by scope, preserving the
    /// other model's declaration order.
    pub fn merge(&mut self, other: DeclarationModel, diagnostics: &mut Vec<Diagnostic>) {
        for scope in other.scopes {
            let id = self.scope_or_insert(&scope.path, scope.kind);
            for item in scope.items {
                self.insert_reporting(id, item, diagnostics);
            }
        }
    }
}

/// What makes two declarations in a scope "the same declaration".
#[derive(Clone, Debug, PartialEq)]
enum Identity {
    /// Records, enums, typedefs, variables, constants and templates: the
    /// name, within the kind's namespace.
    Kind(&'static str),
    /// Overloads are distinguished by their parameter types and constness.
    Function { params: Vec<String>, is_const: bool },
    Specialization(Vec<String>),
    AnonymousEnum(Vec<String>),
}

fn identity(decl: &Decl) -> Option<Identity> {
    let identity = match decl {
        Decl::Record(r) if r.name.is_some() => Identity::Kind("record"),
        Decl::Enum(e) if e.name.is_some() => Identity::Kind("enum"),
        Decl::Enum(e) => Identity::AnonymousEnum(e.members.iter().map(|m| m.name.clone()).collect()),
        Decl::Record(_) => return None,
        Decl::Typedef(_) => Identity::Kind("typedef"),
        Decl::Variable(_) => Identity::Kind("variable"),
        Decl::Constant(_) => Identity::Kind("constant"),
        Decl::Template(_) => Identity::Kind("template"),
        Decl::Function(f) => Identity::Function {
            params: f.signature.params.iter().map(|p| p.ty.to_string()).collect(),
            is_const: f.qualifiers.is_const,
        },
        Decl::Specialization(s) => Identity::Specialization(s.args.iter().map(ToString::to_string).collect()),
    };
    Some(identity)
}

fn same_identity(decl: &Decl, identity: &Identity) -> bool {
    self::identity(decl).as_ref() == Some(identity)
}

enum Reconciliation {
    Same,
    Replace,
    Conflict,
}

fn reconcile(existing: &Decl, new: &Decl) -> Reconciliation {
    match (existing, new) {
        (Decl::Record(old), Decl::Record(new)) if !old.complete || !new.complete => {
            forward_declared(old.complete, new.complete)
        }
        (Decl::Enum(old), Decl::Enum(new)) if !old.complete || !new.complete => {
            forward_declared(old.complete, new.complete)
        }
        (Decl::Template(old), Decl::Template(new))
            if !old.record.complete || !new.record.complete =>
        {
            forward_declared(old.record.complete, new.record.complete)
        }
        (Decl::Specialization(old), Decl::Specialization(new))
            if !old.record.complete || !new.record.complete =>
        {
            forward_declared(old.record.complete, new.record.complete)
        }
        _ if normalized(existing) == normalized(new) => Reconciliation::Same,
        _ => Reconciliation::Conflict,
    }
}

fn forward_declared(old_complete: bool, new_complete: bool) -> Reconciliation {
    if !old_complete && new_complete {
        Reconciliation::Replace
    } else {
        Reconciliation::Same
    }
}

/// Drops what doesn't make two declarations materially different: parameter
/// names and whether a record's name came from a typedef.
fn normalized(decl: &Decl) -> Decl {
    fn strip_function(f: &mut FunctionDecl) {
        for param in &mut f.signature.params {
            param.name = None;
        }
    }
    fn strip_record(r: &mut RecordDecl) {
        r.typedef_name = false;
        r.methods.iter_mut().for_each(strip_function);
    }

    let mut decl = decl.clone();
    match &mut decl {
        Decl::Function(f) => strip_function(f),
        Decl::Record(r) => strip_record(r),
        Decl::Enum(e) => e.typedef_name = false,
        Decl::Template(t) => strip_record(&mut t.record),
        Decl::Specialization(s) => strip_record(&mut s.record),
        Decl::Typedef(_) | Decl::Variable(_) | Decl::Constant(_) => (),
    }
    decl
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn origin(file: &str, line: u32) -> Origin {
        Origin {
            file: file.into(),
            line,
            column: 1,
        }
    }

    fn field(name: &str, ordinal: usize) -> Field {
        Field {
            name: Some(name.into()),
            ty: TypeRef::Primitive(Primitive::Int),
            bit_width: None,
            access: Access::Public,
            ordinal,
            is_static: false,
        }
    }

    fn record(name: &str, fields: &[&str]) -> Decl {
        Decl::Record(RecordDecl {
            fields: fields.iter().enumerate().map(|(i, f)| field(f, i)).collect(),
            complete: true,
            ..RecordDecl::forward(name, RecordKind::Struct)
        })
    }

    fn function(name: &str, param: Option<&str>, ty: Primitive) -> Decl {
        Decl::Function(FunctionDecl {
            name: name.into(),
            kind: FunctionKind::Free,
            signature: Signature {
                return_ty: TypeRef::Primitive(Primitive::Void),
                params: vec![Parameter {
                    name: param.map(Into::into),
                    ty: TypeRef::Primitive(ty),
                    has_default: false,
                }],
                variadic: false,
            },
            qualifiers: FunctionQualifiers::default(),
            access: Access::Public,
            template_params: Vec::new(),
            scope: String::new(),
        })
    }

    fn add(model: &mut DeclarationModel, decl: Decl, line: u32) -> Insertion {
        model.insert(
            DeclarationModel::GLOBAL,
            Item {
                decl,
                origin: origin("a.h", line),
            },
        )
    }

    #[test]
    fn identical_declarations_are_deduplicated() {
        let mut model = DeclarationModel::new();
        add(&mut model, record("Point", &["x", "y"]), 1);
        assert!(matches!(
            add(&mut model, record("Point", &["x", "y"]), 9),
            Insertion::Duplicate(_)
        ));
        assert_eq!(model.len(), 1);
        assert_eq!(model.get("Point").unwrap().origin.line, 1);
    }

    #[test]
    fn different_definitions_conflict_and_the_first_wins() {
        let mut model = DeclarationModel::new();
        add(&mut model, record("Point", &["x", "y"]), 1);
        let mut diagnostics = Vec::new();
        model.insert_reporting(
            DeclarationModel::GLOBAL,
            Item {
                decl: record("Point", &["x", "y", "z"]),
                origin: origin("b.h", 4),
            },
            &mut diagnostics,
        );
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(
            diagnostics[0].to_string(),
            "b.h:4:1: warning: conflicting redeclaration of struct `Point` \
             (first defined at a.h:1:1) [ConflictingRedeclaration]"
        );
        let Decl::Record(kept) = &model.get("Point").unwrap().decl else {
            panic!("not a record");
        };
        assert_eq!(kept.fields.len(), 2);
    }

    #[test]
    fn forward_declarations_are_completed_in_place() {
        let mut model = DeclarationModel::new();
        add(&mut model, Decl::Record(RecordDecl::forward("Node", RecordKind::Struct)), 1);
        add(&mut model, record("Other", &[]), 2);
        assert!(matches!(
            add(&mut model, record("Node", &["next"]), 3),
            Insertion::Completed(_)
        ));
        // And a later forward declaration is a no-op.
        assert!(matches!(
            add(&mut model, Decl::Record(RecordDecl::forward("Node", RecordKind::Struct)), 4),
            Insertion::Duplicate(_)
        ));
        let names: Vec<_> = model.global().items.iter().map(|i| i.decl.name()).collect();
        assert_eq!(names, [Some("Node"), Some("Other")]);
        assert_eq!(model.get("Node").unwrap().origin.line, 3);
    }

    #[test]
    fn overloads_are_kept_and_parameter_names_ignored() {
        let mut model = DeclarationModel::new();
        add(&mut model, function("f", Some("a"), Primitive::Int), 1);
        add(&mut model, function("f", Some("b"), Primitive::Double), 2);
        assert!(matches!(
            add(&mut model, function("f", None, Primitive::Int), 3),
            Insertion::Duplicate(_)
        ));
        assert_eq!(model.lookup("f").count(), 2);
    }

    #[test]
    fn scopes_are_created_with_their_parents() {
        let mut model = DeclarationModel::new();
        let id = model.scope_or_insert("adsk::core", ScopeKind::Namespace);
        let scope = model.scope_by_id(id);
        assert_eq!(scope.name(), "core");
        let parent = model.scope_by_id(scope.parent.unwrap());
        assert_eq!(parent.path, "adsk");
        assert_eq!(model.scopes().len(), 3);
    }

    #[test]
    fn template_arguments_are_not_split() {
        assert_eq!(split_scope("adsk::core::Ptr<std::string>"), ("adsk::core", "Ptr<std::string>"));
        assert_eq!(split_scope("Size"), ("", "Size"));
    }

    #[test]
    fn type_display() {
        let callback = TypeRef::FunctionPointer(Box::new(Signature {
            return_ty: TypeRef::Primitive(Primitive::Void),
            params: vec![Parameter {
                name: Some("user_data".into()),
                ty: TypeRef::Pointer(Box::new(TypeRef::Primitive(Primitive::Void))),
                has_default: false,
            }],
            variadic: false,
        }));
        assert_eq!(callback.to_string(), "void (*)(void *)");

        let name = TypeRef::Pointer(Box::new(TypeRef::qualified(
            Qualifiers::CONST,
            TypeRef::Primitive(Primitive::Char),
        )));
        assert_eq!(name.to_string(), "const char *");
    }
}
