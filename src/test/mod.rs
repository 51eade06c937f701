//! Protected sample images for unit tests.
//!
//! [`protected_image`] builds `Sample.exe` the way the protection leaves it: three virtualized
//! methods on `Sample.Program`, one protected string, the lookup delegates on `<Module>`, the
//! static constructor fragment, native helper stubs and embedded helpers. The original bodies
//! are materialized into the sandbox tables, keyed by the stub that asks for them.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use crate::{
    assembly::{opcodes, Instruction, Operand},
    emulation::{materialize, Delegate, LookupKind, MethodEntry, SandboxTables},
    image::{write_image, ImageFile},
    metadata::{
        method::{ExceptionHandler, ExceptionHandlerFlags, MethodBody},
        token::Token,
        Container, FieldAttributes, ImageKind, ImplMap, MethodAttributes, Resource,
        TypeAttributes,
    },
};

/// The literal behind the protected string.
pub(crate) const SECRET: &str = "Sup3r s3cret";

/// String lookup index of [`SECRET`].
pub(crate) const SECRET_INDEX: i32 = 5;

/// A protected image with what it was built from.
pub(crate) struct ProtectedImage {
    /// The image as written to disk
    pub image: ImageFile,
    /// Stub methods and their original bodies
    pub originals: Vec<(Token, MethodBody)>,
    /// Nested helper type of each stub
    pub helpers: Vec<Token>,
    /// The method holding the protected string
    pub string_user: Token,
}

impl ProtectedImage {
    pub fn tables(&self) -> &SandboxTables {
        self.image.runtime.as_ref().expect("fixture carries runtime tables")
    }

    /// Write the image as `Sample.exe` into `directory`.
    pub fn write_to(&self, directory: &Path) -> PathBuf {
        let path = directory.join(&self.image.container.name);
        write_image(&path, &self.image).unwrap();
        path
    }
}

struct Imports {
    write_line: Token,
    get_message: Token,
    exception: Token,
    get_iunknown: Token,
    release: Token,
}

fn imports(container: &mut Container) -> Imports {
    let mscorlib = container.add_assembly_ref("mscorlib", "4.0.0.0");
    let console = container.import_type_ref(mscorlib, "System", "Console");
    let exception = container.import_type_ref(mscorlib, "System", "Exception");
    let marshal = container.import_type_ref(mscorlib, "System.Runtime.InteropServices", "Marshal");
    Imports {
        write_line: container.import_member_ref(console, "WriteLine", &[0x00, 0x01, 0x01, 0x0E]),
        get_message: container.import_member_ref(exception, "get_Message", &[0x20, 0x00, 0x0E]),
        exception,
        get_iunknown: container.import_member_ref(
            marshal,
            "GetIUnknownForObject",
            &[0x00, 0x01, 0x18, 0x1C],
        ),
        release: container.import_member_ref(marshal, "Release", &[0x00, 0x01, 0x08, 0x18]),
    }
}

/// `ldsfld Invoke; ldc.i4 trigger; callvirt Invoke; ldtoken helper; pop; pop; ret`
pub(crate) fn stub_body(field: Token, invoke: Token, trigger: i32, helper: Token) -> MethodBody {
    MethodBody::new(vec![
        Instruction::with_token(opcodes::LDSFLD, field),
        Instruction::ldc_i4(trigger),
        Instruction::with_token(opcodes::CALLVIRT, invoke),
        Instruction::with_token(opcodes::LDTOKEN, helper),
        Instruction::simple(opcodes::POP),
        Instruction::simple(opcodes::POP),
        Instruction::simple(opcodes::RET),
    ])
}

/// Build the protected `Sample.exe`.
pub(crate) fn protected_image() -> ProtectedImage {
    let mut container = Container::new("Sample.exe", ImageKind::IlOnly);
    let imports = imports(&mut container);
    let global = container.global_type_token();

    // Lookup delegates and the fields holding them
    let method_delegate = container.add_type("", "a", TypeAttributes::SEALED, None);
    let method_invoke = container.add_method(
        method_delegate,
        "Invoke",
        MethodAttributes::PUBLIC | MethodAttributes::VIRTUAL | MethodAttributes::HIDE_BY_SIG,
        None,
    );
    let string_delegate = container.add_type("", "b", TypeAttributes::SEALED, None);
    let string_invoke = container.add_method(
        string_delegate,
        "Invoke",
        MethodAttributes::PUBLIC | MethodAttributes::VIRTUAL | MethodAttributes::HIDE_BY_SIG,
        None,
    );
    let lookup_field = FieldAttributes::ASSEMBLY | FieldAttributes::STATIC;
    let method_field = container.add_field(global, "Invoke", lookup_field, Some(method_delegate));
    let string_field = container.add_field(global, "String", lookup_field, Some(string_delegate));

    // Global helpers, one of them marking a type for removal
    let marked = container.add_type("", "e", TypeAttributes::empty(), None);
    let marker = container.intern_user_string("P0x7f");
    let helper_method = MethodAttributes::PRIVATE | MethodAttributes::STATIC;
    container.add_method(
        global,
        "c",
        helper_method,
        Some(MethodBody::new(vec![
            Instruction::ldstr(marker),
            Instruction::with_token(opcodes::LDTOKEN, marked),
            Instruction::simple(opcodes::POP),
            Instruction::simple(opcodes::POP),
            Instruction::simple(opcodes::RET),
        ])),
    );
    container.add_method(
        global,
        "d",
        helper_method,
        Some(MethodBody::new(vec![Instruction::simple(opcodes::RET)])),
    );

    // Static constructor holding only the protection fragment
    let mut cctor = MethodBody::new(vec![
        Instruction::nop(),
        Instruction::simple(opcodes::LDNULL),
        Instruction::with_token(opcodes::CALL, imports.get_iunknown),
        Instruction::simple(opcodes::POP),
        Instruction::new(opcodes::LEAVE_S, Operand::Target(8)),
        Instruction::with_token(opcodes::CALL, imports.release),
        Instruction::simple(opcodes::POP),
        Instruction::simple(opcodes::ENDFINALLY),
        Instruction::simple(opcodes::RET),
    ]);
    cctor.exception_handlers.push(ExceptionHandler {
        flags: ExceptionHandlerFlags::FINALLY,
        try_start: 0,
        try_end: 5,
        handler_start: 5,
        handler_end: 8,
        filter_start: None,
        catch_type: None,
    });
    container.add_method(
        global,
        ".cctor",
        MethodAttributes::PRIVATE
            | MethodAttributes::STATIC
            | MethodAttributes::SPECIAL_NAME
            | MethodAttributes::RT_SPECIAL_NAME,
        Some(cctor),
    );

    // Native helper imports and embedded helpers
    for (name, module) in [("Secure32", "Protect32.dll"), ("Secure64", "Protect64.dll")] {
        let stub = container.add_method(
            global,
            name,
            MethodAttributes::ASSEMBLY | MethodAttributes::STATIC | MethodAttributes::PINVOKE_IMPL,
            None,
        );
        if let Some(method) = container.method_mut(stub) {
            method.impl_map = Some(ImplMap {
                module: module.to_string(),
                entry_point: "P0".to_string(),
            });
        }
    }
    for name in ["Protect32.dll", "Protect64.dll", "Sample.Properties.Resources.resources"] {
        container.resources.push(Resource {
            name: name.to_string(),
            public: false,
            data: vec![0x4D, 0x5A, 0x90, 0x00],
        });
    }

    // The program
    let program = container.add_type("Sample", "Program", TypeAttributes::PUBLIC, None);
    let count = container.add_field(program, "count", FieldAttributes::STATIC, None);
    let locals = container.intern_signature(&[0x07, 0x01, 0x0E]);
    let hello = container.intern_user_string("Hello");

    let public_static = MethodAttributes::PUBLIC | MethodAttributes::STATIC;
    let main = container.add_method(program, "Main", public_static, None);
    let compute = container.add_method(program, "Compute", public_static, None);
    let guarded = container.add_method(program, "Guarded", public_static, None);

    let main_body = MethodBody::new(vec![
        Instruction::ldstr(hello),
        Instruction::with_token(opcodes::CALL, imports.write_line),
        Instruction::simple(opcodes::RET),
    ]);
    let compute_body = MethodBody {
        max_stack: 2,
        ..MethodBody::new(vec![
            Instruction::simple(opcodes::LDARG_0),
            Instruction::ldc_i4(0),
            Instruction::new(opcodes::BGT_S, Operand::Target(5)),
            Instruction::ldc_i4(0),
            Instruction::simple(opcodes::RET),
            Instruction::simple(opcodes::LDARG_0),
            Instruction::simple(opcodes::RET),
        ])
    };
    let guarded_body = MethodBody {
        max_stack: 3,
        init_locals: true,
        local_var_sig: Some(locals),
        instructions: vec![
            Instruction::ldc_i4(1),
            Instruction::with_token(opcodes::CALL, compute),
            Instruction::with_token(opcodes::STSFLD, count),
            Instruction::new(opcodes::LEAVE_S, Operand::Target(7)),
            Instruction::with_token(opcodes::CALLVIRT, imports.get_message),
            Instruction::with_token(opcodes::CALL, imports.write_line),
            Instruction::new(opcodes::LEAVE_S, Operand::Target(7)),
            Instruction::simple(opcodes::RET),
        ],
        exception_handlers: vec![ExceptionHandler {
            flags: ExceptionHandlerFlags::EXCEPTION,
            try_start: 0,
            try_end: 4,
            handler_start: 4,
            handler_end: 7,
            filter_start: None,
            catch_type: Some(imports.exception),
        }],
    };

    let mut originals = Vec::new();
    let mut helpers = Vec::new();
    let mut entries = Vec::new();
    for (stub, name, trigger, body) in [
        (main, "Main", 3, main_body),
        (compute, "Compute", 7, compute_body),
        (guarded, "Guarded", 11, guarded_body),
    ] {
        let helper = container.add_type(
            "",
            &format!("<{name}>c"),
            TypeAttributes::NESTED_PRIVATE | TypeAttributes::SEALED,
            Some(program),
        );
        entries.push(MethodEntry {
            caller: stub,
            index: trigger,
            body: materialize(&container, name, &body).unwrap(),
        });
        if let Some(method) = container.method_mut(stub) {
            method.body = Some(stub_body(method_field, method_invoke, trigger, helper));
        }
        originals.push((stub, body));
        helpers.push(helper);
    }

    let string_user = container.add_method(
        program,
        "Greet",
        public_static,
        Some(MethodBody::new(vec![
            Instruction::with_token(opcodes::LDSFLD, string_field),
            Instruction::ldc_i4(SECRET_INDEX),
            Instruction::with_token(opcodes::CALLVIRT, string_invoke),
            Instruction::with_token(opcodes::CALL, imports.write_line),
            Instruction::simple(opcodes::RET),
        ])),
    );

    let tables = SandboxTables {
        delegates: vec![
            Delegate {
                field: method_field,
                invoke: method_invoke,
                kind: LookupKind::Method,
            },
            Delegate {
                field: string_field,
                invoke: string_invoke,
                kind: LookupKind::String,
            },
        ],
        methods: entries,
        strings: BTreeMap::from([(SECRET_INDEX, SECRET.to_string())]),
    };

    ProtectedImage {
        image: ImageFile {
            container,
            runtime: Some(tables),
        },
        originals,
        helpers,
        string_user,
    }
}
