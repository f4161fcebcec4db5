//! Handler bodies of the synthetic VM runtime.

use strum::EnumIter;

use crate::{
    assembly::{Code, Instruction, Operand},
    devirt::{OpcodeKind, SpecialAction},
    metadata::token::Token,
    vm::VmOperandKind,
};

/// Every handler shape the fixture can register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter)]
pub enum HandlerShape {
    Add,
    Sub,
    Mul,
    Xor,
    Neg,
    Dup,
    Pop,
    Ret,
    Throw,
    Br,
    Brtrue,
    Blt,
    Switch,
    Leave,
    EndFinally,
    EndFilter,
    Ldloc,
    Stloc,
    Ldarg,
    Starg,
    LdcI4,
    LdcI8,
    Ldstr,
    Ldfld,
    Stfld,
    Call,
    Newobj,
    /// Bare `ret` registered without an operand
    Nop,
    /// Bare `ret` registered with an operand
    NoBodyOperand,
    EazCall,
    StartHomomorphic,
    EndHomomorphic,
    /// A body no template knows; never registered by default
    Unrecognised,
}

impl HandlerShape {
    /// Meaning of the shape in the finished opcode table.
    pub fn expected(self) -> OpcodeKind {
        use HandlerShape as H;
        let native = match self {
            H::Add => Code::Add,
            H::Sub => Code::Sub,
            H::Mul => Code::Mul,
            H::Xor => Code::Xor,
            H::Neg => Code::Neg,
            H::Dup => Code::Dup,
            H::Pop => Code::Pop,
            H::Ret => Code::Ret,
            H::Throw => Code::Throw,
            H::Br => Code::Br,
            H::Brtrue => Code::Brtrue,
            H::Blt => Code::Blt,
            H::Switch => Code::Switch,
            H::Leave => Code::Leave,
            H::EndFinally => Code::Endfinally,
            H::EndFilter => Code::Endfilter,
            H::Ldloc => Code::Ldloc,
            H::Stloc => Code::Stloc,
            H::Ldarg => Code::Ldarg,
            H::Starg => Code::Starg,
            H::LdcI4 => Code::LdcI4,
            H::LdcI8 => Code::LdcI8,
            H::Ldstr => Code::Ldstr,
            H::Ldfld => Code::Ldfld,
            H::Stfld => Code::Stfld,
            H::Call => Code::Call,
            H::Newobj => Code::Newobj,
            H::Nop => Code::Nop,
            H::NoBodyOperand => return OpcodeKind::Special(SpecialAction::NoBody),
            H::EazCall => return OpcodeKind::Special(SpecialAction::EazCall),
            H::StartHomomorphic => return OpcodeKind::Special(SpecialAction::StartHomomorphic),
            H::EndHomomorphic => return OpcodeKind::Special(SpecialAction::EndHomomorphic),
            H::Unrecognised => unreachable!("unrecognised handlers have no meaning"),
        };
        OpcodeKind::Native(native)
    }

    /// Meaning the template library assigns to the handler body alone.
    pub fn template_kind(self) -> OpcodeKind {
        match self {
            HandlerShape::Nop => OpcodeKind::Special(SpecialAction::NoBody),
            other => other.expected(),
        }
    }

    /// Operand kind declared at registration.
    pub fn operand_kind(self) -> VmOperandKind {
        use HandlerShape as H;
        match self {
            H::Br | H::Brtrue | H::Blt | H::Leave => VmOperandKind::Target,
            H::Switch => VmOperandKind::Switch,
            H::Ldloc | H::Stloc => VmOperandKind::Local,
            H::Ldarg | H::Starg => VmOperandKind::Argument,
            H::LdcI4 | H::NoBodyOperand => VmOperandKind::Int32,
            H::LdcI8 => VmOperandKind::Int64,
            H::Ldstr | H::Ldfld | H::Stfld | H::Call | H::Newobj | H::EazCall => {
                VmOperandKind::Member
            }
            H::StartHomomorphic => VmOperandKind::Region,
            _ => VmOperandKind::None,
        }
    }
}

/// Tokens of the VM type members and framework references handler bodies use.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Runtime {
    pub pop: Token,
    pub push: Token,
    pub unwind: Token,
    pub finish_block: Token,
    pub finish_filter: Token,
    pub resolve: Token,
    pub entry: Token,
    pub ip: Token,
    pub finished: Token,
    pub locals: Token,
    pub args: Token,
    pub regions: Token,
    pub int32: Token,
    pub int32_array: Token,
    pub exception: Token,
    pub get_item: Token,
    pub set_item: Token,
    pub stack_push: Token,
    pub stack_pop: Token,
    pub to_int32: Token,
    pub to_int64: Token,
    pub resolve_string: Token,
    pub get_value: Token,
    pub set_value: Token,
    pub invoke: Token,
    pub construct: Token,
}

fn op(code: Code) -> Instruction {
    Instruction::simple(code)
}

fn tok(code: Code, token: Token) -> Instruction {
    Instruction::with_token(code, token)
}

/// Shortest load-constant form of `value`.
pub(crate) fn ldc(value: i32) -> Instruction {
    match value {
        -1 => op(Code::LdcI4M1),
        0 => op(Code::LdcI40),
        1 => op(Code::LdcI41),
        2 => op(Code::LdcI42),
        3 => op(Code::LdcI43),
        4 => op(Code::LdcI44),
        5 => op(Code::LdcI45),
        6 => op(Code::LdcI46),
        7 => op(Code::LdcI47),
        8 => op(Code::LdcI48),
        -128..=127 => Instruction::new(Code::LdcI4S, Operand::Int32(value)),
        _ => Instruction::new(Code::LdcI4, Operand::Int32(value)),
    }
}

fn binary(rt: &Runtime, code: Code) -> Vec<Instruction> {
    use Code::*;
    vec![
        op(Ldarg0),
        op(Ldarg0),
        tok(Call, rt.pop),
        op(Ldarg0),
        tok(Call, rt.pop),
        op(code),
        tok(Call, rt.push),
        op(Ret),
    ]
}

/// Tail shared by the conditional branch handlers: `ip = (int)operand; return;`.
fn jump(rt: &Runtime) -> [Instruction; 5] {
    use Code::*;
    [
        op(Ldarg0),
        op(Ldarg1),
        tok(UnboxAny, rt.int32),
        tok(Stfld, rt.ip),
        op(Ret),
    ]
}

fn with_offsets(mut body: Vec<Instruction>) -> Vec<Instruction> {
    crate::assembly::assign_offsets(&mut body);
    body
}

fn conditional(rt: &Runtime, head: Vec<Instruction>) -> Vec<Instruction> {
    let mut body = head;
    body.push(op(Code::Ret));
    let skip = body.len();
    body.extend(jump(rt));
    let mut body = with_offsets(body);
    let target = body[skip].offset;
    if let Some(branch) = body.iter_mut().find(|i| i.code.is_boolean_branch() || i.code.is_compare_branch()) {
        branch.operand = Operand::Target(target);
    }
    body
}

fn resolved_push(rt: &Runtime, converter: Token) -> Vec<Instruction> {
    use Code::*;
    vec![op(Ldarg0), op(Ldarg1), tok(Call, converter), tok(Call, rt.push), op(Ret)]
}

fn resolved_invoke(rt: &Runtime, member: Token) -> Vec<Instruction> {
    use Code::*;
    vec![op(Ldarg0), op(Ldarg1), tok(Call, rt.resolve), tok(Callvirt, member), op(Ret)]
}

/// Body of a handler of `shape`.
pub(crate) fn handler_body(shape: HandlerShape, rt: &Runtime) -> Vec<Instruction> {
    use Code::*;
    use HandlerShape as H;
    match shape {
        H::Add => binary(rt, Add),
        H::Sub => binary(rt, Sub),
        H::Mul => binary(rt, Mul),
        H::Xor => binary(rt, Xor),
        H::Neg => vec![
            op(Ldarg0),
            op(Ldarg0),
            tok(Call, rt.pop),
            op(Neg),
            tok(Call, rt.push),
            op(Ret),
        ],
        H::Dup => vec![op(Ldarg0), op(Ldarg0), tok(Call, rt.pop), tok(Call, rt.push), op(Ret)],
        H::Pop => vec![op(Ldarg0), tok(Call, rt.pop), op(Pop), op(Ret)],
        H::Ret => vec![op(Ldarg0), ldc(1), tok(Stfld, rt.finished), op(Ret)],
        H::Throw => vec![
            op(Ldarg0),
            tok(Call, rt.pop),
            tok(Castclass, rt.exception),
            op(Throw),
        ],
        H::Br => jump(rt).to_vec(),
        H::Brtrue => conditional(
            rt,
            vec![
                op(Ldarg0),
                tok(Call, rt.pop),
                Instruction::new(BrtrueS, Operand::Target(0)),
            ],
        ),
        H::Blt => conditional(
            rt,
            vec![
                op(Ldarg0),
                tok(Call, rt.pop),
                op(Ldarg0),
                tok(Call, rt.pop),
                Instruction::new(BltS, Operand::Target(0)),
            ],
        ),
        H::Switch => vec![
            op(Ldarg0),
            op(Ldarg1),
            tok(Castclass, rt.int32_array),
            op(Ldarg0),
            tok(Call, rt.pop),
            tok(UnboxAny, rt.int32),
            op(LdelemI4),
            tok(Stfld, rt.ip),
            op(Ret),
        ],
        H::Leave => vec![
            op(Ldarg0),
            op(Ldarg1),
            tok(UnboxAny, rt.int32),
            tok(Call, rt.unwind),
            op(Ret),
        ],
        H::EndFinally => vec![op(Ldarg0), tok(Call, rt.finish_block), op(Ret)],
        H::EndFilter => vec![
            op(Ldarg0),
            op(Ldarg0),
            tok(Call, rt.pop),
            tok(UnboxAny, rt.int32),
            tok(Call, rt.finish_filter),
            op(Ret),
        ],
        H::Ldloc => vec![
            op(Ldarg0),
            op(Ldarg0),
            tok(Ldfld, rt.locals),
            op(Ldarg1),
            tok(UnboxAny, rt.int32),
            tok(Callvirt, rt.get_item),
            tok(Call, rt.push),
            op(Ret),
        ],
        H::Stloc => vec![
            op(Ldarg0),
            tok(Ldfld, rt.locals),
            op(Ldarg1),
            tok(UnboxAny, rt.int32),
            op(Ldarg0),
            tok(Call, rt.pop),
            tok(Callvirt, rt.set_item),
            op(Ret),
        ],
        H::Ldarg => vec![
            op(Ldarg0),
            op(Ldarg0),
            tok(Ldfld, rt.args),
            op(Ldarg1),
            tok(UnboxAny, rt.int32),
            op(LdelemRef),
            tok(Call, rt.push),
            op(Ret),
        ],
        H::Starg => vec![
            op(Ldarg0),
            tok(Ldfld, rt.args),
            op(Ldarg1),
            tok(UnboxAny, rt.int32),
            op(Ldarg0),
            tok(Call, rt.pop),
            op(StelemRef),
            op(Ret),
        ],
        H::LdcI4 => resolved_push(rt, rt.to_int32),
        H::LdcI8 => resolved_push(rt, rt.to_int64),
        H::Ldstr => resolved_push(rt, rt.resolve_string),
        H::Ldfld => resolved_invoke(rt, rt.get_value),
        H::Stfld => resolved_invoke(rt, rt.set_value),
        H::Call => resolved_invoke(rt, rt.invoke),
        H::Newobj => resolved_invoke(rt, rt.construct),
        H::Nop | H::NoBodyOperand => vec![op(Ret)],
        H::EazCall => vec![op(Ldarg0), op(Ldarg1), tok(Call, rt.entry), op(Ret)],
        H::StartHomomorphic => vec![
            op(Ldarg0),
            tok(Ldfld, rt.regions),
            op(Ldarg1),
            tok(UnboxAny, rt.int32),
            tok(Callvirt, rt.stack_push),
            op(Ret),
        ],
        H::EndHomomorphic => vec![
            op(Ldarg0),
            tok(Ldfld, rt.regions),
            tok(Callvirt, rt.stack_pop),
            op(Pop),
            op(Ret),
        ],
        H::Unrecognised => vec![op(Ldnull), op(Throw)],
    }
}
