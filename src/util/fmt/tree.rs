use std::{fmt::Display, io::Write};

use crate::{
    ast::{self, ItemKind, TranslationUnit, TypeExpr},
    model::{
        Access, Decl, DeclarationModel, EnumDecl, FunctionDecl, FunctionKind, Item, Parsed, Phase,
        RecordDecl, Resolved, ScopeKind, TemplateParam, TemplateParamKind, TypeRef,
    },
};

const INDENT_WIDTH: usize = 2;

pub fn print_unit_string(unit: &TranslationUnit) -> String {
    let mut buf = Vec::with_capacity(1024);
    // Writing to a `Vec` never fails.
    let _ = print_unit(&mut buf, unit);
    String::from_utf8_lossy(&buf).into_owned()
}

pub fn print_model_string(model: &DeclarationModel) -> String {
    let mut buf = Vec::with_capacity(1024);
    let _ = print_model(&mut buf, model);
    String::from_utf8_lossy(&buf).into_owned()
}

/// Prints the parsed declarations of a file, nested as written.
pub fn print_unit(w: &mut impl Write, unit: &TranslationUnit) -> std::io::Result<()> {
    for item in &unit.items {
        print_item(w, 0, item)?;
    }
    Ok(())
}

/// Prints every non-empty scope of the model, followed by its declarations.
/// The declarations of the global scope are not indented.
pub fn print_model(w: &mut impl Write, model: &DeclarationModel) -> std::io::Result<()> {
    for scope in model.scopes() {
        if scope.items.is_empty() {
            continue;
        }
        let i = match scope.kind {
            ScopeKind::Global => 0,
            ScopeKind::Namespace => {
                writeln!(w, "namespace {}", scope.path)?;
                1
            }
            ScopeKind::Record => {
                writeln!(w, "record {}", scope.path)?;
                1
            }
        };
        for Item { decl, .. } in &scope.items {
            print_decl(w, i, decl)?;
        }
    }
    Ok(())
}

fn print_item(w: &mut impl Write, i: usize, item: &ast::Item) -> std::io::Result<()> {
    match &item.kind {
        ItemKind::Decl { decl, nested } => {
            print_decl(w, i, decl)?;
            for item in nested {
                print_item(w, i + 1, item)?;
            }
        }
        ItemKind::Namespace { name, items } => {
            sp(w, i)?;
            writeln!(w, "namespace {}", name.as_deref().unwrap_or("<anonymous>"))?;
            for item in items {
                print_item(w, i + 1, item)?;
            }
        }
    }
    Ok(())
}

pub fn print_decl<P: TypeWriter>(w: &mut impl Write, i: usize, decl: &Decl<P>) -> std::io::Result<()> {
    match decl {
        Decl::Record(record) => {
            sp(w, i)?;
            write_record_header(w, record)?;
            writeln!(w)?;
            print_record_body(w, i + 1, record)?;
        }
        Decl::Enum(e) => print_enum(w, i, e)?,
        Decl::Typedef(t) => {
            sp(w, i)?;
            write!(w, "typedef {} = ", t.name)?;
            P::write_type(w, &t.ty)?;
            P::write_terminal(w, &t.ty)?;
            writeln!(w)?;
        }
        Decl::Function(f) => print_function(w, i, f)?,
        Decl::Variable(v) => {
            sp(w, i)?;
            write!(w, "variable {}: ", v.name)?;
            P::write_type(w, &v.ty)?;
            write_flags(w, [(v.is_extern, "extern"), (v.is_static, "static")], None)?;
            writeln!(w)?;
        }
        Decl::Constant(c) => {
            sp(w, i)?;
            writeln!(w, "constant {} = {}", c.name, c.value)?;
        }
        Decl::Template(t) => {
            sp(w, i)?;
            write!(w, "template ")?;
            write_template_params(w, &t.params)?;
            write!(w, " ")?;
            write_record_header(w, &t.record)?;
            writeln!(w)?;
            print_record_body(w, i + 1, &t.record)?;
        }
        Decl::Specialization(s) => {
            sp(w, i)?;
            write!(w, "specialization ")?;
            if !s.params.is_empty() {
                write_template_params(w, &s.params)?;
                write!(w, " ")?;
            }
            write!(w, "{}<", s.template)?;
            write_list(w, &s.args)?;
            write!(w, ">")?;
            if !s.record.complete {
                write!(w, " (incomplete)")?;
            }
            if s.orphaned {
                write!(w, " (orphaned)")?;
            }
            writeln!(w)?;
            print_record_body(w, i + 1, &s.record)?;
        }
    }
    Ok(())
}

fn write_record_header<P: Phase>(w: &mut impl Write, record: &RecordDecl<P>) -> std::io::Result<()> {
    write!(w, "{} {}", record.kind, record.name.as_deref().unwrap_or("<anonymous>"))?;
    if record.typedef_name {
        write!(w, " (typedef)")?;
    }
    if !record.complete {
        write!(w, " (incomplete)")?;
    }
    Ok(())
}

fn print_record_body<P: TypeWriter>(
    w: &mut impl Write,
    i: usize,
    record: &RecordDecl<P>,
) -> std::io::Result<()> {
    for base in &record.bases {
        sp(w, i)?;
        write!(w, "base {}", base.access)?;
        if base.is_virtual {
            write!(w, " virtual")?;
        }
        writeln!(w, " {}", base.name)?;
    }
    for field in &record.fields {
        sp(w, i)?;
        write!(w, "field {}: ", field.name.as_deref().unwrap_or("<anonymous>"))?;
        let anonymous = P::anonymous(&field.ty);
        match &anonymous {
            Some(Anonymous::Record(record)) => write!(w, "{}", record.kind)?,
            Some(Anonymous::Enum(_)) => write!(w, "enum")?,
            None => P::write_type(w, &field.ty)?,
        }
        if let Some(width) = &field.bit_width {
            write!(w, " : {width}")?;
        }
        write_flags(w, [(field.is_static, "static")], Some(field.access))?;
        writeln!(w)?;
        match anonymous {
            Some(Anonymous::Record(record)) => print_record_body(w, i + 1, record)?,
            Some(Anonymous::Enum(e)) => print_enumerators(w, i + 1, e)?,
            None => {}
        }
    }
    for method in &record.methods {
        print_function(w, i, method)?;
    }
    Ok(())
}

fn print_enum<P: TypeWriter>(w: &mut impl Write, i: usize, e: &EnumDecl<P>) -> std::io::Result<()> {
    sp(w, i)?;
    write!(w, "enum ")?;
    if e.scoped {
        write!(w, "class ")?;
    }
    write!(w, "{} : ", e.name.as_deref().unwrap_or("<anonymous>"))?;
    P::write_type(w, &e.underlying)?;
    if e.typedef_name {
        write!(w, " (typedef)")?;
    }
    if !e.complete {
        write!(w, " (incomplete)")?;
    }
    writeln!(w)?;
    print_enumerators(w, i + 1, e)
}

fn print_enumerators<P: Phase>(w: &mut impl Write, i: usize, e: &EnumDecl<P>) -> std::io::Result<()> {
    for member in &e.members {
        sp(w, i)?;
        match &member.value {
            Some(value) => writeln!(w, "{} = {value}", member.name)?,
            None => writeln!(w, "{}", member.name)?,
        }
    }
    Ok(())
}

fn print_function<P: TypeWriter>(
    w: &mut impl Write,
    i: usize,
    f: &FunctionDecl<P>,
) -> std::io::Result<()> {
    sp(w, i)?;
    if !f.template_params.is_empty() {
        write!(w, "template ")?;
        write_template_params(w, &f.template_params)?;
        write!(w, " ")?;
    }
    let kind = match f.kind {
        FunctionKind::Free => "function",
        FunctionKind::Method => "method",
        FunctionKind::Constructor => "constructor",
        FunctionKind::Destructor => "destructor",
        FunctionKind::Operator => "operator",
        FunctionKind::Conversion => "conversion",
    };
    write!(w, "{kind} {}(", f.name)?;
    let sig = &f.signature;
    for (idx, param) in sig.params.iter().enumerate() {
        if idx > 0 {
            write!(w, ", ")?;
        }
        if let Some(name) = &param.name {
            write!(w, "{name}: ")?;
        }
        P::write_type(w, &param.ty)?;
        if param.has_default {
            write!(w, " = ...")?;
        }
    }
    if sig.variadic {
        write!(w, "{}", if sig.params.is_empty() { "..." } else { ", ..." })?;
    }
    write!(w, ") -> ")?;
    P::write_type(w, &sig.return_ty)?;

    let q = f.qualifiers;
    let flags = [
        (q.is_virtual, "virtual"),
        (q.is_pure, "pure"),
        (q.is_const, "const"),
        (q.is_static, "static"),
        (q.is_inline, "inline"),
        (q.is_extern, "extern"),
        (q.is_explicit, "explicit"),
    ];
    write_flags(w, flags, Some(f.access))?;
    writeln!(w)
}

fn write_template_params<P: TypeWriter>(
    w: &mut impl Write,
    params: &[TemplateParam<P>],
) -> std::io::Result<()> {
    write!(w, "<")?;
    for (idx, param) in params.iter().enumerate() {
        if idx > 0 {
            write!(w, ", ")?;
        }
        let pack = if param.pack { "..." } else { "" };
        match &param.kind {
            TemplateParamKind::Type { .. } => write!(w, "typename{pack}")?,
            TemplateParamKind::NonType { ty, .. } => {
                P::write_type(w, ty)?;
                write!(w, "{pack}")?;
            }
            TemplateParamKind::Template { .. } => write!(w, "template class{pack}")?,
        }
        if let Some(name) = &param.name {
            write!(w, " {name}")?;
        }
        match &param.kind {
            TemplateParamKind::Type { default: Some(ty) } => {
                write!(w, " = ")?;
                P::write_type(w, ty)?;
            }
            TemplateParamKind::NonType {
                default: Some(text),
                ..
            }
            | TemplateParamKind::Template {
                default: Some(text),
            } => write!(w, " = {text}")?,
            _ => {}
        }
    }
    write!(w, ">")
}

/// Writes the set flags, plus the access when not public, as `[a, b]`.
fn write_flags<const N: usize>(
    w: &mut impl Write,
    flags: [(bool, &str); N],
    access: Option<Access>,
) -> std::io::Result<()> {
    let access = access.filter(|a| *a != Access::Public).map(|a| a.to_string());
    let mut set: Vec<&str> = flags.iter().filter(|(on, _)| *on).map(|(_, name)| *name).collect();
    if let Some(access) = &access {
        set.push(access);
    }
    if !set.is_empty() {
        write!(w, " [{}]", set.join(", "))?;
    }
    Ok(())
}

fn write_list(w: &mut impl Write, items: &[impl Display]) -> std::io::Result<()> {
    for (idx, item) in items.iter().enumerate() {
        if idx > 0 {
            write!(w, ", ")?;
        }
        write!(w, "{item}")?;
    }
    Ok(())
}

fn sp(w: &mut impl Write, i: usize) -> std::io::Result<()> {
    write!(w, "{:width$}", "", width = i * INDENT_WIDTH)
}

/// A record or enum defined in place, as the type of a field.
pub enum Anonymous<'a, P: Phase> {
    Record(&'a RecordDecl<P>),
    Enum(&'a EnumDecl<P>),
}

pub trait TypeWriter: Phase<Type: Display, Arg: Display, Name: Display> + Sized {
    fn write_type(w: &mut impl Write, ty: &Self::Type) -> std::io::Result<()> {
        write!(w, "{ty}")
    }

    /// Writes what a typedef resolves to, when it names another typedef.
    fn write_terminal(w: &mut impl Write, ty: &Self::Type) -> std::io::Result<()> {
        _ = (w, ty);
        Ok(())
    }

    fn anonymous(ty: &Self::Type) -> Option<Anonymous<'_, Self>>;
}

impl TypeWriter for Parsed {
    fn anonymous(ty: &TypeExpr) -> Option<Anonymous<'_, Parsed>> {
        match ty {
            TypeExpr::Record(record) if record.name.is_none() => Some(Anonymous::Record(record)),
            TypeExpr::Enum(e) if e.name.is_none() => Some(Anonymous::Enum(e)),
            _ => None,
        }
    }
}

impl TypeWriter for Resolved {
    /// Also writes the specialization an instantiation selected.
    fn write_type(w: &mut impl Write, ty: &TypeRef) -> std::io::Result<()> {
        write!(w, "{ty}")?;
        if let TypeRef::Instantiation(inst) = ty.unqualified() {
            if let Some(args) = &inst.specialization {
                write!(w, " (specialization <")?;
                write_list(w, args)?;
                write!(w, ">)")?;
            }
        }
        Ok(())
    }

    fn write_terminal(w: &mut impl Write, ty: &TypeRef) -> std::io::Result<()> {
        if let TypeRef::Alias { .. } = ty.unqualified() {
            write!(w, " (terminal {})", ty.terminal())?;
        }
        Ok(())
    }

    fn anonymous(ty: &TypeRef) -> Option<Anonymous<'_, Resolved>> {
        match ty {
            TypeRef::AnonymousRecord(record) => Some(Anonymous::Record(record)),
            TypeRef::AnonymousEnum(e) => Some(Anonymous::Enum(e)),
            _ => None,
        }
    }
}
