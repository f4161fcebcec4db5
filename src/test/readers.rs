//! Scrambled integer readers as the protector emits them.

use crate::{
    assembly::{Code, Instruction, Operand},
    file::io::ByteOrder,
    metadata::{
        method::{MethodAttributes, MethodBody, MethodSig},
        module::Module,
        token::Token,
    },
    test::handlers::ldc,
};

/// Fields and helpers a reader body refers to.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReaderFields {
    pub buffer: Token,
    pub position: Token,
    pub int32: Token,
}

/// How a reader walks the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReaderStyle {
    /// Advance the position field once, then read constant indices
    Indexed,
    /// Read `buffer[position]` into a local per byte
    Cursor,
    /// Read `buffer[position++]` into a local per byte
    PostIncrement,
}

fn op(code: Code) -> Instruction {
    Instruction::simple(code)
}

fn local(code: Code, index: usize) -> Instruction {
    Instruction::new(code, Operand::Local(index as u16))
}

/// Return type name of a reader of `width` bytes.
pub(crate) fn return_type(width: usize) -> &'static str {
    match width {
        1 => "System.Byte",
        2 => "System.UInt16",
        8 => "System.Int64",
        _ => "System.Int32",
    }
}

/// Body of an instance reader assembling `order.width()` bytes of the buffer field.
///
/// The cursor styles load every byte through the position field into a local first and combine
/// the locals; the post-increment one also writes the advanced position back, keeping the old one
/// in a scratch local. `mix` appends a call to a static helper whose result is or-ed into the value.
pub(crate) fn reader_body(
    order: ByteOrder,
    fields: ReaderFields,
    style: ReaderStyle,
    mix: Option<Token>,
) -> MethodBody {
    let width = order.width();
    let permutation = order.permutation();
    let mut body = Vec::new();

    if style != ReaderStyle::Indexed {
        for k in 0..width {
            body.extend([
                op(Code::Ldarg0),
                Instruction::with_token(Code::Ldfld, fields.buffer),
            ]);
            if style == ReaderStyle::PostIncrement {
                body.extend([
                    op(Code::Ldarg0),
                    op(Code::Ldarg0),
                    Instruction::with_token(Code::Ldfld, fields.position),
                    op(Code::Dup),
                    local(Code::StlocS, width),
                    ldc(1),
                    op(Code::Add),
                    Instruction::with_token(Code::Stfld, fields.position),
                    local(Code::LdlocS, width),
                ]);
            } else {
                body.extend([
                    op(Code::Ldarg0),
                    Instruction::with_token(Code::Ldfld, fields.position),
                ]);
            }
            body.extend([op(Code::LdelemU1), local(Code::StlocS, k)]);
        }
        for (i, &index) in permutation.iter().enumerate() {
            body.push(local(Code::LdlocS, usize::from(index)));
            if i > 0 {
                body.extend([ldc(8 * i as i32), op(Code::Shl), op(Code::Or)]);
            }
        }
    } else {
        body.extend([
            op(Code::Ldarg0),
            op(Code::Ldarg0),
            Instruction::with_token(Code::Ldfld, fields.position),
            ldc(width as i32),
            op(Code::Add),
            Instruction::with_token(Code::Stfld, fields.position),
        ]);
        for (i, &index) in permutation.iter().enumerate() {
            body.extend([
                op(Code::Ldarg0),
                Instruction::with_token(Code::Ldfld, fields.buffer),
                ldc(i32::from(index)),
                op(Code::LdelemU1),
            ]);
            if i > 0 {
                body.extend([ldc(8 * i as i32), op(Code::Shl), op(Code::Or)]);
            }
        }
    }

    if let Some(mix) = mix {
        body.extend([Instruction::with_token(Code::Call, mix), op(Code::Or)]);
    }
    body.push(op(Code::Ret));

    let mut body = MethodBody::new(body);
    match style {
        ReaderStyle::Indexed => {}
        ReaderStyle::Cursor => body.locals = vec![fields.int32; width],
        ReaderStyle::PostIncrement => body.locals = vec![fields.int32; width + 1],
    }
    body
}

/// Builds a module holding a single scrambled integer reader.
#[derive(Debug, Clone)]
pub struct ScrambledReaderBuilder {
    order: ByteOrder,
    style: ReaderStyle,
    call_in_slice: bool,
}

impl ScrambledReaderBuilder {
    /// A reader implementing `order`.
    pub fn new(order: ByteOrder) -> Self {
        ScrambledReaderBuilder {
            order,
            style: ReaderStyle::Indexed,
            call_in_slice: false,
        }
    }

    /// Reads every byte through the position field.
    pub fn with_cursor(mut self) -> Self {
        self.style = ReaderStyle::Cursor;
        self
    }

    /// Reads every byte as `buffer[position++]`.
    pub fn with_post_increment(mut self) -> Self {
        self.style = ReaderStyle::PostIncrement;
        self
    }

    /// Mixes the result of a static call into the value.
    pub fn with_call_in_slice(mut self) -> Self {
        self.call_in_slice = true;
        self
    }

    /// Returns the module and the reader method.
    pub fn build(self) -> (Module, Token) {
        let mut module = Module::new("Reader.dll");
        let ty = module.add_type("", "BinaryReader");
        let byte_array = module.import_type("System.Byte[]");
        let int32 = module.import_type("System.Int32");
        let ret = module.import_type(return_type(self.order.width()));
        let fields = ReaderFields {
            buffer: module.add_field(ty, "buffer", byte_array, false),
            position: module.add_field(ty, "position", int32, false),
            int32,
        };
        let mix = self.call_in_slice.then(|| {
            module.add_method(
                ty,
                "Mix",
                MethodAttributes::STATIC,
                MethodSig::new_static(Vec::new(), Some(int32)),
                None,
            )
        });
        let body = reader_body(self.order, fields, self.style, mix);
        let reader = module.add_method(
            ty,
            "Read",
            MethodAttributes::PUBLIC,
            MethodSig::new_instance(Vec::new(), Some(ret)),
            Some(body),
        );
        (module, reader)
    }
}
