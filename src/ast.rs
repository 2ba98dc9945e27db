// unit ::= item*
// item ::= 'namespace' [ID ('::' ID)*] '{' item* '}'
//        | 'extern' STRING ('{' item* '}' | item)
//        | 'template' '<' [template_param (',' template_param)*] '>' item
//        | 'using' ID '=' type ';'
//        | specifiers [declarator (',' declarator)*] ';'
//        | specifiers declarator body
// specifiers ::= (storage | qualifier | primitive | path | elaborated | record | enum)+
// record ::= ('struct' | 'class' | 'union') [path] [':' base (',' base)*] ['{' member* '}']
// enum ::= 'enum' ['class' | 'struct'] [ID] [':' type] ['{' enumerator (',' enumerator)* [','] '}']
// member ::= access ':' | item
// declarator ::= ptr_op* (name | '(' declarator ')' | ε) suffix* [':' expr] ['=' expr]
// ptr_op ::= '*' qualifier* | '&' | '&&'
// suffix ::= '[' [expr] ']' | '(' [param (',' param)*] [',' '...'] ')' function_tail
// path ::= ['::'] ID ['<' [arg (',' arg)*] '>'] ('::' ID ['<' [arg (',' arg)*] '>'])*
// arg ::= type | expr

use std::fmt;

use serde::Serialize;

use crate::model::{
    Decl, EnumDecl, NamedKind, Origin, Parsed, Primitive, Qualifiers, RecordDecl, Signature, Value,
};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PathSegment {
    pub name: String,
    /// Template arguments, as in `Ptr<T>`.
    pub args: Option<Vec<TypeArg>>,
}

/// A possibly qualified name, as written.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Path {
    /// Whether the path starts with `::`.
    pub absolute: bool,
    pub segments: Vec<PathSegment>,
}

impl Path {
    pub fn simple(name: impl Into<String>) -> Path {
        Path {
            absolute: false,
            segments: vec![PathSegment {
                name: name.into(),
                args: None,
            }],
        }
    }

    pub fn last(&self) -> &PathSegment {
        // Paths are never constructed empty.
        &self.segments[self.segments.len() - 1]
    }

    /// Whether the path is a single identifier with no template arguments.
    pub fn is_simple(&self) -> bool {
        !self.absolute && self.segments.len() == 1 && self.segments[0].args.is_none()
    }

    /// The path without any template arguments, such as `adsk::core::Ptr`.
    pub fn plain_name(&self) -> String {
        let names: Vec<&str> = self.segments.iter().map(|s| s.name.as_str()).collect();
        names.join("::")
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.absolute {
            f.write_str("::")?;
        }
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str("::")?;
            }
            f.write_str(&segment.name)?;
            if let Some(args) = &segment.args {
                f.write_str("<")?;
                for (j, arg) in args.iter().enumerate() {
                    if j > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(">")?;
            }
        }
        Ok(())
    }
}

/// A type, as written.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum TypeExpr {
    Primitive(Primitive),
    Path(Path),
    /// `struct X`, `enum E`...
    Elaborated(NamedKind, Path),
    /// `typename T::value_type`.
    Dependent(Path),
    Pointer(Box<TypeExpr>),
    Reference(Box<TypeExpr>),
    RValueReference(Box<TypeExpr>),
    Array(Box<TypeExpr>, Option<Value>),
    Function(Box<Signature<Parsed>>),
    Qualified(Qualifiers, Box<TypeExpr>),
    /// An anonymous record defined in place.
    Record(Box<RecordDecl<Parsed>>),
    /// An anonymous enum defined in place.
    Enum(Box<EnumDecl<Parsed>>),
}

impl TypeExpr {
    pub fn qualified(qualifiers: Qualifiers, ty: TypeExpr) -> TypeExpr {
        if qualifiers.is_empty() {
            ty
        } else {
            TypeExpr::Qualified(qualifiers, Box::new(ty))
        }
    }
}

impl fmt::Display for TypeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeExpr::Primitive(p) => f.write_str(p.as_str()),
            TypeExpr::Path(path) => write!(f, "{path}"),
            TypeExpr::Elaborated(NamedKind::Enum, path) => write!(f, "enum {path}"),
            TypeExpr::Elaborated(NamedKind::Union, path) => write!(f, "union {path}"),
            TypeExpr::Elaborated(NamedKind::Struct | NamedKind::Class, path) => {
                write!(f, "struct {path}")
            }
            TypeExpr::Dependent(path) => write!(f, "typename {path}"),
            TypeExpr::Pointer(inner) => write!(f, "{inner} *"),
            TypeExpr::Reference(inner) => write!(f, "{inner} &"),
            TypeExpr::RValueReference(inner) => write!(f, "{inner} &&"),
            TypeExpr::Array(inner, Some(size)) => write!(f, "{inner}[{size}]"),
            TypeExpr::Array(inner, None) => write!(f, "{inner}[]"),
            TypeExpr::Function(sig) => {
                write!(f, "{}(", sig.return_ty)?;
                for (i, param) in sig.params.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", param.ty)?;
                }
                f.write_str(")")
            }
            TypeExpr::Qualified(q, inner) => {
                if q.is_const {
                    f.write_str("const ")?;
                }
                if q.is_volatile {
                    f.write_str("volatile ")?;
                }
                write!(f, "{inner}")
            }
            TypeExpr::Record(record) => write!(f, "{} {{...}}", record.kind),
            TypeExpr::Enum(_) => f.write_str("enum {...}"),
        }
    }
}

/// A template argument, as written.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum TypeArg {
    Type(TypeExpr),
    /// A non-type argument, kept as source text.
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

#[derive(Clone, Debug, PartialEq)]
pub struct Item {
    pub kind: ItemKind,
    pub origin: Origin,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ItemKind {
    Decl {
        decl: Decl<Parsed>,
        /// Declarations nested in a record or template body, such as member
        /// typedefs and nested classes.
        nested: Vec<Item>,
    },
    Namespace {
        /// `None` for anonymous (and inline) namespaces, whose members
        /// belong to the enclosing scope.
        name: Option<String>,
        items: Vec<Item>,
    },
}

/// The parsed declarations of a preprocessed file, in source order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TranslationUnit {
    pub items: Vec<Item>,
}
