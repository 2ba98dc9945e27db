use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use declscan::{
    config::Config,
    diagnostic::{Diagnostic, DiagnosticKind, Severity},
    extract::{extract, extract_file, Extractor, SourceMap},
    model::{
        Access, ConstValue, Decl, FunctionKind, NamedKind, Primitive, Qualifiers, ScopeKind,
        TypeArg, TypeRef, Value,
    },
    util::fmt::tree::print_model_string,
};
use indoc::indoc;
use pretty_assertions::assert_eq;

fn core_sources() -> SourceMap {
    [
        ("core/macros.h", include_str!("fixtures/core/macros.h")),
        ("core/memory.hpp", include_str!("fixtures/core/memory.hpp")),
        ("core/base.hpp", include_str!("fixtures/core/base.hpp")),
    ]
    .into_iter()
    .collect()
}

fn linux() -> Config {
    Config::default().with_flag("__linux__", true)
}

fn kinds(diagnostics: &[Diagnostic]) -> Vec<DiagnosticKind> {
    diagnostics.iter().map(|d| d.kind).collect()
}

#[track_caller]
fn assert_clean(diagnostics: &[Diagnostic]) {
    assert!(diagnostics.is_empty(), "unexpected diagnostics: {diagnostics:#?}");
}

#[test]
fn c_header() {
    let sources: SourceMap = [("graphics.h", include_str!("fixtures/graphics.h"))]
        .into_iter()
        .collect();
    let extraction = extract(&sources, &Config::default());
    assert_clean(&extraction.diagnostics);

    let expected = indoc! {r#"
        constant GRAPHICS_VERSION = 3
        constant GRAPHICS_NAME = "graphics"
        enum Status : int (typedef)
          STATUS_OK = 0
          STATUS_INVALID = -1
          STATUS_NO_MEMORY = -2
        enum Channel : int
          CHANNEL_RED
          CHANNEL_GREEN
          CHANNEL_BLUE
        struct Point
          field x: int
          field y: int
        struct Size (typedef)
          field width: int
          field height: int
        struct Canvas (typedef)
          field pixels: unsigned char *
          field size: Size
          field stride: unsigned int
        typedef DrawCallback = void (*)(void *)
        typedef Comparator = int (*)(const void *, const void *)
        function point_make(x: int, y: int) -> Point
        function canvas_new(size: Size) -> Canvas *
        function canvas_free(canvas: Canvas *) -> void
        function canvas_fill(canvas: Canvas *, channel: enum Channel, value: unsigned char) -> enum Status
        function trace_printf(fmt: const char *, ...) -> void
        variable graphics_debug: int [extern]
    "#};
    assert_eq!(print_model_string(&extraction.model), expected);
}

#[test]
fn cpp_headers_with_includes() {
    let extraction = extract(&core_sources(), &linux());
    assert_clean(&extraction.diagnostics);
    let model = &extraction.model;

    let core = model.scope("core").unwrap();
    assert_eq!(core.kind, ScopeKind::Namespace);

    // Included declarations are extracted with every includer, and merged.
    assert_eq!(model.lookup("core::Ptr").count(), 1);
    assert_eq!(model.lookup("core::ReferenceCounted").count(), 1);
    assert_eq!(
        model.get("core::ReferenceCounted").unwrap().origin.file,
        "core/memory.hpp"
    );

    let Decl::Record(base) = &model.get("core::Base").unwrap().decl else {
        panic!("not a record");
    };
    assert!(base.complete);
    assert_eq!(base.bases[0].name, "core::ReferenceCounted");
    assert_eq!(base.bases[0].access, Access::Public);

    let class_type = base.methods.iter().find(|m| m.name == "classType").unwrap();
    assert!(class_type.qualifiers.is_static);
    let object_type = base.methods.iter().find(|m| m.name == "objectType").unwrap();
    assert!(object_type.qualifiers.is_virtual && object_type.qualifiers.is_pure);
    assert!(object_type.qualifiers.is_const);
    assert_eq!(
        object_type.signature.return_ty.to_string(),
        "const char *"
    );
    let instances = base.methods.iter().find(|m| m.name == "instances").unwrap();
    assert_eq!(instances.signature.return_ty, TypeRef::Builtin("size_t".into()));

    let cast = base.methods.iter().find(|m| m.name == "cast").unwrap();
    assert_eq!(cast.template_params.len(), 1);
    assert_eq!(cast.signature.return_ty.to_string(), "core::Ptr<T>");

    let constructor = base.methods.iter().find(|m| m.kind == FunctionKind::Constructor).unwrap();
    assert_eq!(constructor.access, Access::Protected);
    assert!(constructor.signature.params.is_empty());
    let destructor = base.methods.iter().find(|m| m.kind == FunctionKind::Destructor).unwrap();
    assert_eq!(destructor.name, "~Base");
    assert!(destructor.qualifiers.is_virtual);

    let Decl::Template(ptr) = &model.get("core::Ptr").unwrap().decl else {
        panic!("not a template");
    };
    let operators: Vec<&str> = ptr
        .record
        .methods
        .iter()
        .filter(|m| m.kind == FunctionKind::Operator)
        .map(|m| m.name.as_str())
        .collect();
    assert_eq!(operators, ["operator->", "operator*", "operator=="]);
    let field = &ptr.record.fields[0];
    assert_eq!(field.access, Access::Private);
    assert_eq!(field.ty, TypeRef::Pointer(Box::new(TypeRef::Param("T".into()))));
    let Decl::Typedef(element_type) = &model.get("core::Ptr::element_type").unwrap().decl else {
        panic!("not a typedef");
    };
    assert_eq!(element_type.ty, TypeRef::Param("T".into()));

    let Decl::Enum(severity) = &model.get("core::Severity").unwrap().decl else {
        panic!("not an enum");
    };
    assert!(severity.scoped);
    assert_eq!(severity.underlying, TypeRef::Primitive(Primitive::UnsignedChar));
    assert_eq!(severity.members[1].value, Some(Value::Int(2)));

    let Decl::Function(distance) = &model.get("core::computeDistance").unwrap().decl else {
        panic!("not a function");
    };
    let base_ref = TypeRef::Reference(Box::new(TypeRef::Qualified(
        Qualifiers::CONST,
        Box::new(TypeRef::Named {
            name: "core::Base".into(),
            kind: NamedKind::Class,
        }),
    )));
    assert_eq!(distance.signature.params[0].ty, base_ref);
    assert_eq!(distance.scope, "core");

    let Decl::Constant(max_name) = &model.get("CORE_MAX_NAME").unwrap().decl else {
        panic!("not a constant");
    };
    assert_eq!(max_name.value, ConstValue::Int(64));
}

#[test]
fn platform_errors_are_reported_but_not_fatal() {
    let sources = core_sources();
    let outcome = extract_file(&sources, "core/base.hpp", &Config::default());
    assert_eq!(kinds(&outcome.diagnostics), [DiagnosticKind::ErrorDirective]);
    assert_eq!(outcome.diagnostics[0].severity, Severity::Error);
    assert!(outcome.model.unwrap().get("core::Base").is_some());
}

#[test]
fn specializations_are_selected_per_instantiation() {
    let sources: SourceMap = [("containers.hpp", include_str!("fixtures/containers.hpp"))]
        .into_iter()
        .collect();
    let extraction = extract(&sources, &Config::default());
    assert_clean(&extraction.diagnostics);

    let Decl::Record(registry) = &extraction.model.get("store::Registry").unwrap().decl else {
        panic!("not a record");
    };
    let selected: Vec<(String, Option<String>)> = registry
        .fields
        .iter()
        .map(|field| {
            let TypeRef::Instantiation(inst) = &field.ty else {
                panic!("not an instantiation");
            };
            let specialization = inst.specialization.as_ref().map(|args| {
                args.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
            });
            (field.ty.to_string(), specialization)
        })
        .collect();
    assert_eq!(
        selected,
        [
            ("store::Container<int>".to_owned(), Some("int".to_owned())),
            ("store::Container<const char *>".to_owned(), Some("T *".to_owned())),
            ("store::Container<double>".to_owned(), None),
            ("store::Map<int, store::Container<float>>".to_owned(), None),
        ]
    );

    let TypeRef::Instantiation(groups) = &registry.fields[3].ty else {
        panic!("not an instantiation");
    };
    assert_eq!(groups.args[0], TypeArg::Type(TypeRef::Primitive(Primitive::Int)));

    let specializations: Vec<_> = extraction
        .model
        .lookup("store::Container")
        .filter_map(|item| match &item.decl {
            Decl::Specialization(s) => Some((s.is_partial(), s.orphaned)),
            _ => None,
        })
        .collect();
    assert_eq!(specializations, [(false, false), (true, false)]);
}

#[test]
fn conflicting_redeclarations_keep_the_first_definition() {
    let sources: SourceMap = [
        ("a.h", "struct Point { int x; int y; };\n"),
        ("b.h", "struct Point { int x; int y; int z; };\n"),
        ("c.h", "struct Point { int x; int y; };\n"),
    ]
    .into_iter()
    .collect();
    let extraction = extract(&sources, &Config::default());

    let messages: Vec<String> = extraction.diagnostics.iter().map(ToString::to_string).collect();
    assert_eq!(
        messages,
        ["b.h:1:1: warning: conflicting redeclaration of struct `Point` \
          (first defined at a.h:1:1) [ConflictingRedeclaration]"]
    );
    let Decl::Record(point) = &extraction.model.get("Point").unwrap().decl else {
        panic!("not a record");
    };
    assert_eq!(point.fields.len(), 2);
    assert_eq!(extraction.model.len(), 1);
}

#[test]
fn forward_declarations_are_completed_by_other_files() {
    let sources: SourceMap = [
        ("list.h", "struct Node;\nstruct List { struct Node *head; };\n"),
        ("node.h", "struct Node { int value; struct Node *next; };\n"),
    ]
    .into_iter()
    .collect();
    let extraction = extract(&sources, &Config::default());
    assert_clean(&extraction.diagnostics);

    let names: Vec<_> = extraction
        .model
        .global()
        .items
        .iter()
        .map(|item| item.decl.name())
        .collect();
    assert_eq!(names, [Some("Node"), Some("List")]);
    let node = extraction.model.get("Node").unwrap();
    assert_eq!(node.origin.file, "node.h");
    let Decl::Record(node) = &node.decl else {
        panic!("not a record");
    };
    assert!(node.complete);
}

fn typedef_chain(length: usize) -> String {
    let mut header = String::from("typedef int T0;\n");
    for i in 1..length {
        header.push_str(&format!("typedef T{} T{i};\n", i - 1));
    }
    header
}

#[test]
fn typedef_chains_are_bounded() {
    let sources: SourceMap = [
        ("short.h", typedef_chain(5)),
        ("long.h", typedef_chain(40)),
    ]
    .into_iter()
    .collect();

    let extraction = extract(&sources, &Config::default());
    assert_eq!(kinds(&extraction.diagnostics), [DiagnosticKind::CyclicTypedef]);
    assert_eq!(extraction.diagnostics[0].file, "long.h");
    assert_eq!(extraction.model.len(), 5);
    let Decl::Typedef(t4) = &extraction.model.get("T4").unwrap().decl else {
        panic!("not a typedef");
    };
    assert_eq!(t4.ty.terminal(), &TypeRef::Primitive(Primitive::Int));

    let extraction = extract(&sources, &Config::default().with_max_typedef_depth(64));
    assert_clean(&extraction.diagnostics);
    assert_eq!(extraction.model.len(), 40);
}

#[test]
fn lexical_errors_drop_only_their_file() {
    let sources: SourceMap = [
        ("bad.h", "int a;\nconst char *s = \"oops;\n"),
        ("good.h", "int b;\n"),
    ]
    .into_iter()
    .collect();
    let extraction = extract(&sources, &Config::default());
    assert_eq!(kinds(&extraction.diagnostics), [DiagnosticKind::LexError]);
    assert_eq!(extraction.diagnostics[0].file, "bad.h");
    assert!(extraction.model.get("a").is_none());
    assert!(extraction.model.get("b").is_some());
}

#[test]
fn dropped_files_keep_earlier_diagnostics() {
    let sources: SourceMap = [("bad.h", "#foo\nint x;\nconst char *s = \"abc;\n")]
        .into_iter()
        .collect();
    let outcome = extract_file(&sources, "bad.h", &Config::default());
    assert!(outcome.model.is_none());
    assert_eq!(
        kinds(&outcome.diagnostics),
        [DiagnosticKind::MalformedDirective, DiagnosticKind::LexError]
    );
    assert_eq!(
        outcome.diagnostics[1].to_string(),
        "bad.h:3:17: error: unterminated string literal [LexError]"
    );
}

#[test]
fn unrecognized_declarations_are_skipped() {
    let sources: SourceMap = [(
        "win.h",
        "DECLARE_HANDLE(Window);\nAPI void init(void);\nvoid shutdown(void);\n",
    )]
    .into_iter()
    .collect();

    let extraction = extract(&sources, &Config::default());
    assert_eq!(
        kinds(&extraction.diagnostics),
        [DiagnosticKind::UnsupportedMacro, DiagnosticKind::UnsupportedMacro]
    );
    assert!(extraction.model.get("shutdown").is_some());
    assert!(extraction.model.get("init").is_none());

    let config = Config::default().with_stripped_macro("API").with_stripped_macro("DECLARE_HANDLE");
    let extraction = extract(&sources, &config);
    assert_clean(&extraction.diagnostics);
    assert!(extraction.model.get("init").is_some());
}

#[test]
fn output_does_not_depend_on_scheduling() {
    let mut sources = core_sources();
    sources.insert("graphics.h", include_str!("fixtures/graphics.h"));
    sources.insert("containers.hpp", include_str!("fixtures/containers.hpp"));

    let run = |workers: usize| {
        let config = linux().with_workers(NonZeroUsize::new(workers).unwrap());
        serde_json::to_string(&extract(&sources, &config)).unwrap()
    };
    let sequential = run(1);
    assert_eq!(run(4), sequential);
    assert_eq!(run(2), sequential);
}

#[test]
fn models_serialize_to_json() {
    let sources: SourceMap = [("a.h", "struct Point { int x; };\n")].into_iter().collect();
    let extraction = extract(&sources, &Config::default());
    let json = serde_json::to_value(&extraction.model).unwrap();

    let global = &json["scopes"][0];
    assert_eq!(global["path"], "");
    assert_eq!(global["kind"], "global");
    let item = &global["items"][0];
    assert_eq!(item["origin"]["file"], "a.h");
    assert_eq!(item["decl"]["decl"], "record");
    assert_eq!(item["decl"]["name"], "Point");
    assert_eq!(item["decl"]["kind"], "struct");
    assert_eq!(item["decl"]["fields"][0]["ty"]["Primitive"], "Int");
}

#[test]
fn cancellation_skips_unstarted_files() {
    let cancel = Arc::new(AtomicBool::new(false));
    let extractor = Extractor::new(Config::default()).with_cancel_flag(Arc::clone(&cancel));
    cancel.store(true, Ordering::SeqCst);

    let extraction = extractor.run(&core_sources());
    assert_eq!(
        extraction.cancelled,
        ["core/macros.h", "core/memory.hpp", "core/base.hpp"]
    );
    assert!(extraction.model.is_empty());
    assert_clean(&extraction.diagnostics);
}
