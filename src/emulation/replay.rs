//! Dependency slicing and replay of straight-line host code.
//!
//! [`dependency_slice`] walks a method body once, tracking for every evaluation stack slot and
//! local the set of instructions its value was computed from. The set attached to the value consumed
//! by `ret` is the backward slice of the method's result. [`replay`] then executes only the sliced
//! instructions, with field and array loads answered by [`ReplayHooks`].
//!
//! A `dup` can feed one copy into the slice and the other into a side computation, as in
//! `buffer[position++]`. The slice records how many copies stay inside it so the replay pushes
//! exactly those.

use std::collections::{BTreeSet, HashMap};

use crate::{
    assembly::{Code, FlowType, Instruction},
    emulation::value::EmValue,
    metadata::{module::Module, token::Token},
    Error, Result,
};

/// Interception points for loads the replay cannot compute on its own.
pub trait ReplayHooks {
    /// Value produced by loading `field` (static or instance).
    ///
    /// Returning `None` aborts the replay.
    fn load_field(&mut self, module: &Module, field: Token) -> Option<EmValue>;

    /// Value produced by loading element `index` of `array`.
    ///
    /// The default reads byte arrays.
    fn load_element(&mut self, array: &EmValue, index: i64) -> Option<EmValue> {
        match array {
            EmValue::Bytes(bytes) => usize::try_from(index)
                .ok()
                .and_then(|i| bytes.get(i))
                .map(|byte| EmValue::I32(i32::from(*byte))),
            _ => None,
        }
    }
}

type Deps = BTreeSet<usize>;

/// Backward slice of a method's returned value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Slice {
    indices: Deps,
    /// `dup` index to the number of its copies consumed inside the slice
    live_copies: HashMap<usize, usize>,
}

impl Slice {
    /// Sliced instruction indices in body order.
    pub fn indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.indices.iter().copied()
    }

    /// Returns `true` if instruction `index` is part of the slice.
    #[must_use]
    pub fn contains(&self, index: usize) -> bool {
        self.indices.contains(&index)
    }

    /// Number of sliced instructions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Returns `true` for an empty slice.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Copies the `dup` at `index` must push during replay.
    #[must_use]
    pub fn live_copies(&self, index: usize) -> usize {
        self.live_copies.get(&index).copied().unwrap_or(0)
    }
}

/// One evaluation stack slot during slicing.
struct Tracked {
    deps: Deps,
    /// The `dup` that pushed this copy
    dup: Option<usize>,
}

fn unsupported(instruction: &Instruction) -> Error {
    Error::UnsupportedInstructionInSlice {
        offset: instruction.offset,
        mnemonic: instruction.code.mnemonic(),
    }
}

fn stack_effect(module: &Module, instruction: &Instruction) -> Result<(usize, usize)> {
    if let Some((pops, pushes)) = instruction.code.stack_effect() {
        return Ok((usize::from(pops), usize::from(pushes)));
    }
    let sig = instruction
        .token()
        .and_then(|token| module.method_sig(token))
        .ok_or_else(|| unsupported(instruction))?;
    Ok(match instruction.code {
        Code::Newobj => (sig.params.len(), 1),
        _ => (sig.call_pops(), usize::from(sig.returns_value())),
    })
}

/// Computes the indices of the instructions the returned value of `instructions` depends on.
///
/// Only straight-line bodies can be sliced: control flow before the first `ret` is rejected.
/// Stores to fields are not tracked; every field load is treated as an independent input.
///
/// # Errors
///
/// Returns [`Error::UnsupportedInstructionInSlice`] for branches or calls without a known
/// signature, and [`Error::Malformed`] for stack underflow or a body that returns no value.
pub fn dependency_slice(module: &Module, instructions: &[Instruction]) -> Result<Slice> {
    let mut stack: Vec<Tracked> = Vec::new();
    let mut locals: HashMap<u16, Deps> = HashMap::new();
    let mut args: HashMap<u16, Deps> = HashMap::new();
    // dup index -> consumers of its copies
    let mut consumers: HashMap<usize, Vec<usize>> = HashMap::new();

    for (index, instruction) in instructions.iter().enumerate() {
        let code = instruction.code;
        if code == Code::Ret {
            let result = stack
                .pop()
                .ok_or_else(|| malformed_error!("method returns no value"))?;
            if let Some(dup) = result.dup {
                consumers.entry(dup).or_default().push(index);
            }
            let mut indices = result.deps;
            indices.insert(index);
            let live_copies = consumers
                .into_iter()
                .filter(|(dup, _)| indices.contains(dup))
                .map(|(dup, users)| {
                    let live = users.iter().filter(|user| indices.contains(user)).count();
                    (dup, live)
                })
                .collect();
            return Ok(Slice {
                indices,
                live_copies,
            });
        }
        if !matches!(code.flow(), FlowType::Sequential | FlowType::Call) {
            return Err(unsupported(instruction));
        }

        let (pops, pushes) = stack_effect(module, instruction)?;
        if stack.len() < pops {
            return Err(malformed_error!(
                "stack underflow at IL_{:04x} ({})",
                instruction.offset,
                code.mnemonic()
            ));
        }
        let mut deps = Deps::new();
        for slot in stack.drain(stack.len() - pops..) {
            if let Some(dup) = slot.dup {
                consumers.entry(dup).or_default().push(index);
            }
            deps.extend(slot.deps);
        }
        deps.insert(index);

        match code.family() {
            Some(crate::assembly::Family::LoadLocal) => {
                if let Some(local) = instruction.local_index().and_then(|i| locals.get(&i)) {
                    deps.extend(local.iter().copied());
                }
            }
            Some(crate::assembly::Family::StoreLocal) => {
                if let Some(local) = instruction.local_index() {
                    locals.insert(local, deps.clone());
                }
            }
            Some(crate::assembly::Family::LoadArgument) => {
                if let Some(arg) = instruction.argument_index().and_then(|i| args.get(&i)) {
                    deps.extend(arg.iter().copied());
                }
            }
            _ => {
                if matches!(code, Code::StargS | Code::Starg) {
                    if let Some(arg) = instruction.argument_index() {
                        args.insert(arg, deps.clone());
                    }
                }
            }
        }

        let dup = (code == Code::Dup).then_some(index);
        for _ in 0..pushes {
            stack.push(Tracked {
                deps: deps.clone(),
                dup,
            });
        }
    }
    Err(malformed_error!("method has no return"))
}

/// Replays the instructions of `instructions` selected by `slice`, in body order, and returns the
/// value left for `ret`.
///
/// `args` supplies argument values; missing arguments load as [`EmValue::Object`].
///
/// # Errors
///
/// Returns [`Error::UnsupportedInstructionInSlice`] for any instruction outside the replay
/// allow-list or a load the hooks decline to answer.
pub fn replay(
    module: &Module,
    instructions: &[Instruction],
    slice: &Slice,
    args: &[EmValue],
    hooks: &mut dyn ReplayHooks,
) -> Result<EmValue> {
    let mut stack: Vec<EmValue> = Vec::new();
    let mut locals: HashMap<u16, EmValue> = HashMap::new();
    let mut args: Vec<EmValue> = args.to_vec();

    let pop = |stack: &mut Vec<EmValue>, instruction: &Instruction| {
        stack.pop().ok_or_else(|| {
            malformed_error!("replay stack underflow at IL_{:04x}", instruction.offset)
        })
    };

    for index in slice.indices() {
        let Some(instruction) = instructions.get(index) else {
            return Err(Error::OutOfBounds);
        };
        let code = instruction.code;
        log::trace!("replay {instruction:?}");

        if let Some(value) = instruction.ldc_value() {
            stack.push(if code == Code::LdcI8 {
                EmValue::I64(value)
            } else {
                EmValue::I32(value as i32)
            });
            continue;
        }

        match code {
            Code::LdcR4 | Code::LdcR8 => match instruction.operand {
                crate::assembly::Operand::Float32(value) => stack.push(EmValue::F64(f64::from(value))),
                crate::assembly::Operand::Float64(value) => stack.push(EmValue::F64(value)),
                _ => return Err(unsupported(instruction)),
            },
            Code::Ldnull => stack.push(EmValue::Null),
            Code::Ldarg0 | Code::Ldarg1 | Code::Ldarg2 | Code::Ldarg3 | Code::LdargS | Code::Ldarg => {
                let arg = instruction.argument_index().ok_or_else(|| unsupported(instruction))?;
                stack.push(args.get(usize::from(arg)).cloned().unwrap_or(EmValue::Object));
            }
            Code::StargS | Code::Starg => {
                let arg = usize::from(instruction.argument_index().ok_or_else(|| unsupported(instruction))?);
                let value = pop(&mut stack, instruction)?;
                if args.len() <= arg {
                    args.resize(arg + 1, EmValue::Object);
                }
                args[arg] = value;
            }
            Code::Ldloc0 | Code::Ldloc1 | Code::Ldloc2 | Code::Ldloc3 | Code::LdlocS | Code::Ldloc => {
                let local = instruction.local_index().ok_or_else(|| unsupported(instruction))?;
                stack.push(locals.get(&local).cloned().unwrap_or(EmValue::I32(0)));
            }
            Code::Stloc0 | Code::Stloc1 | Code::Stloc2 | Code::Stloc3 | Code::StlocS | Code::Stloc => {
                let local = instruction.local_index().ok_or_else(|| unsupported(instruction))?;
                let value = pop(&mut stack, instruction)?;
                locals.insert(local, value);
            }
            Code::Ldfld | Code::Ldsfld => {
                if code == Code::Ldfld {
                    pop(&mut stack, instruction)?;
                }
                let field = instruction.token().ok_or_else(|| unsupported(instruction))?;
                let value = hooks
                    .load_field(module, field)
                    .ok_or_else(|| unsupported(instruction))?;
                stack.push(value);
            }
            Code::LdelemU1 | Code::LdelemU2 | Code::LdelemI4 | Code::LdelemRef => {
                let index = pop(&mut stack, instruction)?;
                let array = pop(&mut stack, instruction)?;
                let index = index.as_i64().ok_or_else(|| unsupported(instruction))?;
                let value = hooks
                    .load_element(&array, index)
                    .ok_or_else(|| unsupported(instruction))?;
                stack.push(value);
            }
            Code::Ldlen => {
                let array = pop(&mut stack, instruction)?;
                match array {
                    EmValue::Bytes(bytes) => stack.push(EmValue::I64(bytes.len() as i64)),
                    _ => return Err(unsupported(instruction)),
                }
            }
            Code::Dup => {
                let value = pop(&mut stack, instruction)?;
                for _ in 0..slice.live_copies(index) {
                    stack.push(value.clone());
                }
            }
            Code::Pop => {
                pop(&mut stack, instruction)?;
            }
            Code::Ret => return pop(&mut stack, instruction),
            _ if code.is_binary_operator() => {
                let right = pop(&mut stack, instruction)?;
                let left = pop(&mut stack, instruction)?;
                stack.push(EmValue::binary(code, &left, &right)?);
            }
            _ if code.is_unary_operator() => {
                let value = pop(&mut stack, instruction)?;
                stack.push(EmValue::unary(code, &value)?);
            }
            _ => return Err(unsupported(instruction)),
        }
    }
    Err(malformed_error!("replay slice ends without a return"))
}
