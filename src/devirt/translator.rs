//! Method translator.
//!
//! Each [`VirtualizedMethod`] moves through three steps:
//!
//! 1. its entry is decoded from the resolution stream and the local types are resolved
//! 2. its virtual instructions are decoded one at a time and replaced by native instructions,
//!    while every virtual offset is recorded against the native offset of the instruction emitted
//!    for it
//! 3. branch targets and exception handler boundaries are remapped from virtual to native offsets
//!
//! Homomorphic regions are opaque. Their payload is skipped, the markers emit nothing, and offsets
//! of the markers map to the next native instruction after the region.

use crate::{
    assembly::{Code, FlowType, Instruction, Operand, OperandType},
    devirt::{
        context::Context,
        events::EventKind,
        method::{MethodState, OffsetMap, VirtualizedMethod},
        opcodes::{OpcodeKind, SpecialAction},
    },
    metadata::{
        exceptions::{ExceptionHandler, ExceptionHandlerFlags},
        token::Token,
    },
    vm::{read_opcode, InlineOperand, OperandData, VirtualMethodEntry, VmOperand, VmReader},
    Error, Result,
};

/// Translates every discovered method that has not failed yet.
///
/// Errors are contained per method: a failing method is marked [`MethodState::Failed`] with the
/// reason and the remaining methods are still translated.
pub fn translate_all(ctx: &mut Context) {
    let mut methods = std::mem::take(&mut ctx.methods);
    for method in methods.iter_mut().filter(|m| !m.is_failed()) {
        match translate_method(ctx, method) {
            Ok(()) => {
                log::debug!(
                    "translated {} ({} instructions)",
                    method.name().unwrap_or("?"),
                    method.instructions.len()
                );
                ctx.events
                    .record(EventKind::MethodTranslated)
                    .method(method.stub)
                    .location(method.key)
                    .message(format!("{} instructions", method.instructions.len()));
            }
            Err(e) => {
                log::warn!("method key {:#x} ({}): {}", method.key, method.stub, e);
                ctx.events
                    .record(EventKind::MethodFailed)
                    .method(method.stub)
                    .location(method.key)
                    .message(e.to_string());
                method.fail(e.to_string());
            }
        }
    }
    ctx.methods = methods;
}

/// Runs all translation steps on `method`.
///
/// # Errors
///
/// Any decode, resolution or remapping error of this method.
pub fn translate_method(ctx: &mut Context, method: &mut VirtualizedMethod) -> Result<()> {
    decode_metadata(ctx, method)?;
    decode_body(ctx, method)?;
    remap(ctx, method)?;
    method.state = MethodState::Translated;
    method.successfully_translated = true;
    Ok(())
}

fn decode_metadata(ctx: &mut Context, method: &mut VirtualizedMethod) -> Result<()> {
    let entry = VirtualMethodEntry::read_at(
        ctx.resolution()?,
        method.key,
        ctx.bytecode()?,
        &ctx.layout,
    )?;

    ctx.resolve_operand(&entry.record.declaring_type)?;
    ctx.resolve_operand(&entry.record.return_type)?;
    for parameter in &entry.record.parameters {
        ctx.resolve_operand(&parameter.param_type)?;
    }
    method.locals = entry
        .record
        .locals
        .iter()
        .map(|local| ctx.resolve_operand(local))
        .collect::<Result<Vec<_>>>()?;

    method.entry = Some(entry);
    method.state = MethodState::MetadataDecoded;
    Ok(())
}

fn decode_body(ctx: &mut Context, method: &mut VirtualizedMethod) -> Result<()> {
    let (start, length) = method
        .entry
        .as_ref()
        .map(|e| (e.code_position as usize, e.code_length))
        .ok_or_else(|| Error::Error("method metadata not decoded".into()))?;
    let end = start + length as usize;
    let bytecode = ctx.bytecode()?.clone();
    let mut reader = VmReader::at(&bytecode, start)?;

    let mut offsets = OffsetMap::new();
    let mut pending: Vec<u32> = Vec::new();
    let mut regions: Vec<u32> = Vec::new();
    let mut instructions: Vec<Instruction> = Vec::new();
    let mut native = 0u32;

    while reader.pos() < end {
        let virtual_offset = (reader.pos() - start) as u32;
        pending.push(virtual_offset);

        let value = read_opcode(&mut reader, &ctx.layout)?;
        let entry = *ctx.opcodes.get(value)?;
        let operand = VmOperand::read(&mut reader, entry.operand_kind, &bytecode, &ctx.layout)?;

        let emitted = match entry.kind {
            OpcodeKind::Special(SpecialAction::StartHomomorphic) => {
                let VmOperand::Region(payload) = operand else {
                    return Err(malformed_error!(
                        "homomorphic start at {:#x} carries {:?}",
                        virtual_offset,
                        operand
                    ));
                };
                reader.advance_by(payload as usize)?;
                regions.push(virtual_offset);
                method.has_homomorphic_encryption = true;
                ctx.events
                    .record(EventKind::HomomorphicRegion)
                    .method(method.stub)
                    .location(virtual_offset)
                    .message(format!("{payload} opaque bytes"));
                None
            }
            OpcodeKind::Special(SpecialAction::EndHomomorphic) => {
                regions
                    .pop()
                    .ok_or(Error::UnbalancedHomomorphicRegion(virtual_offset))?;
                None
            }
            OpcodeKind::Special(SpecialAction::NoBody) => None,
            OpcodeKind::Special(SpecialAction::EazCall) => {
                let key = eaz_call_key(&operand).ok_or_else(|| {
                    malformed_error!("call at {:#x} carries {:?}", virtual_offset, operand)
                })?;
                Some(Instruction::with_token(Code::Call, ctx.resolve_callee(key)?))
            }
            OpcodeKind::Native(code) => Some(native_instruction(ctx, code, operand)?),
        };

        if let Some(mut instruction) = emitted {
            for pending in pending.drain(..) {
                offsets.insert(pending, native);
            }
            instruction.offset = native;
            native += instruction.size();
            instructions.push(instruction);
        }
    }

    if reader.pos() != end {
        return Err(malformed_error!(
            "last instruction overruns the code of key {:#x} by {} bytes",
            method.key,
            reader.pos() - end
        ));
    }
    if let Some(open) = regions.first() {
        return Err(Error::UnbalancedHomomorphicRegion(*open));
    }
    for pending in pending {
        offsets.insert(pending, native);
    }
    offsets.insert(length, native);

    method.instructions = instructions;
    method.offset_map = offsets;
    method.state = MethodState::BodyDecoded;
    Ok(())
}

fn eaz_call_key(operand: &VmOperand) -> Option<u32> {
    match operand {
        VmOperand::Member(InlineOperand::Position { data, .. }) => match data.as_ref() {
            OperandData::EazCall(call) => Some(call.method_key),
            _ => None,
        },
        _ => None,
    }
}

fn is_static_field(ctx: &Context, operand: &VmOperand, token: Option<Token>) -> bool {
    let declared = match operand {
        VmOperand::Member(InlineOperand::Position { data, .. }) => {
            matches!(data.as_ref(), OperandData::Field(field) if field.is_static)
        }
        _ => false,
    };
    declared || token.and_then(|t| ctx.module.field(t)).is_some_and(|f| f.is_static)
}

fn native_instruction(ctx: &mut Context, code: Code, operand: VmOperand) -> Result<Instruction> {
    let code = code.long_form();
    let branch = matches!(
        code.flow(),
        FlowType::ConditionalBranch | FlowType::UnconditionalBranch | FlowType::Leave
    );
    let locals = matches!(code, Code::Ldloc | Code::Stloc);

    let converted = match (code.operand_type(), &operand) {
        (OperandType::None, VmOperand::None) => Operand::None,
        (OperandType::Int32, VmOperand::Target(target)) if branch => Operand::Target(*target),
        (OperandType::Int32, VmOperand::Int32(value)) if !branch => Operand::Int32(*value),
        (OperandType::Int32, VmOperand::Byte(value)) if !branch => Operand::Int32(i32::from(*value)),
        (OperandType::Int64, VmOperand::Int64(value)) => Operand::Int64(*value),
        (OperandType::Int64, VmOperand::Int32(value)) => Operand::Int64(i64::from(*value)),
        (OperandType::Float32, VmOperand::Single(value)) => Operand::Float32(*value),
        (OperandType::Float64, VmOperand::Double(value)) => Operand::Float64(*value),
        (OperandType::UInt16, VmOperand::Local(index)) if locals => Operand::Local(*index),
        (OperandType::UInt16, VmOperand::Argument(index)) if !locals => Operand::Argument(*index),
        (OperandType::UInt16, VmOperand::Byte(index)) if locals => Operand::Local(u16::from(*index)),
        (OperandType::UInt16, VmOperand::Byte(index)) => Operand::Argument(u16::from(*index)),
        (OperandType::Token, VmOperand::Member(member)) => Operand::Token(ctx.resolve_operand(member)?),
        (OperandType::Switch, VmOperand::Switch(targets)) => Operand::Switch(targets.clone()),
        _ => {
            return Err(malformed_error!(
                "{} cannot take operand {:?}",
                code.mnemonic(),
                operand
            ))
        }
    };

    let code = match code {
        Code::Ldfld if is_static_field(ctx, &operand, token_of(&converted)) => Code::Ldsfld,
        Code::Stfld if is_static_field(ctx, &operand, token_of(&converted)) => Code::Stsfld,
        other => other,
    };
    Ok(Instruction::new(code, converted))
}

fn token_of(operand: &Operand) -> Option<Token> {
    match operand {
        Operand::Token(token) => Some(*token),
        _ => None,
    }
}

fn remap(ctx: &mut Context, method: &mut VirtualizedMethod) -> Result<()> {
    let map = &method.offset_map;
    for instruction in &mut method.instructions {
        match &mut instruction.operand {
            Operand::Target(target) => *target = map.get(*target)?,
            Operand::Switch(targets) => {
                for target in targets.iter_mut() {
                    *target = map.get(*target)?;
                }
            }
            _ => {}
        }
    }

    let handlers = method
        .entry
        .as_ref()
        .map(|e| e.handlers.clone())
        .unwrap_or_default();
    let mut remapped = Vec::with_capacity(handlers.len());
    for handler in &handlers {
        let try_offset = map.get(handler.try_start)?;
        let try_end = map.get(handler.try_end())?;
        let handler_offset = map.get(handler.handler_start)?;
        let handler_end = method
            .instructions
            .iter()
            .find(|i| i.offset >= handler_offset && i.is_terminal())
            .map(|i| i.offset + i.size())
            .ok_or(Error::OffsetMapMiss(handler.handler_start))?;

        let filter_offset = if handler.kind.contains(ExceptionHandlerFlags::FILTER) {
            let filter_offset = map.get(handler.filter_start)?;
            let closed = method
                .instructions
                .iter()
                .take_while(|i| i.offset < handler_offset)
                .last()
                .is_some_and(|i| i.offset >= filter_offset && i.code == Code::Endfilter);
            if !closed {
                return Err(malformed_error!(
                    "filter at {:#x} is not closed by endfilter before its handler",
                    handler.filter_start
                ));
            }
            filter_offset
        } else {
            0
        };
        let catch_type = if handler.kind == ExceptionHandlerFlags::EXCEPTION {
            if !ctx.module.contains(handler.catch_type) {
                return Err(Error::TokenNotFound(handler.catch_type));
            }
            Some(handler.catch_type)
        } else {
            None
        };

        remapped.push(ExceptionHandler {
            flags: handler.kind,
            try_offset,
            try_length: try_end.saturating_sub(try_offset),
            handler_offset,
            handler_length: handler_end - handler_offset,
            catch_type,
            filter_offset,
        });
    }
    method.exception_handlers = remapped;
    Ok(())
}
