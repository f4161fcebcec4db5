//! Opcode table recovery.
//!
//! The dispatch initializer registers one handler per private opcode, in a fixed sequence of
//! `Register(opcode, operandKind, handler)` calls. Each registration is located with the
//! [`Anchor::DispatchEntry`] pattern and each handler body is classified against the
//! [`TemplateLibrary`].

use crate::{
    assembly::Instruction,
    devirt::{
        anchors::{token_at, Anchor, AnchorRegistry},
        events::{EventKind, EventLog},
        opcodes::{OpcodeKind, OpcodeTable, OpcodeTableEntry, SpecialAction},
        templates::TemplateLibrary,
    },
    metadata::{module::Module, token::Token},
    pattern::MatchWindow,
    vm::{BuildFingerprint, VmOperandKind},
    Error, Result,
};

/// One registration of the dispatch initializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchEntry {
    /// Private opcode value
    pub value: u16,
    /// Declared operand shape
    pub operand_kind: VmOperandKind,
    /// Handler method
    pub handler: Token,
}

/// The registrations of the dispatch initializer, in construction order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTable {
    /// The initializer method
    pub initializer: Token,
    /// The VM type owning the initializer and the handlers
    pub dispatch_type: Token,
    /// Registrations in construction order
    pub entries: Vec<DispatchEntry>,
}

impl DispatchTable {
    /// Build fingerprint of the initializer's opcode sequence.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TokenNotFound`] if the initializer vanished from `module`.
    pub fn fingerprint(&self, module: &Module) -> Result<BuildFingerprint> {
        let body = module
            .method(self.initializer)
            .and_then(|m| m.body.as_ref())
            .ok_or(Error::TokenNotFound(self.initializer))?;
        Ok(BuildFingerprint::from_codes(&body.codes()))
    }
}

fn registration(window: &MatchWindow<'_>) -> Result<DispatchEntry> {
    let constant = |slot: usize| {
        window
            .at(slot)
            .and_then(Instruction::ldc_value)
            .ok_or_else(|| malformed_error!("registration at {} lacks constant {}", window.start, slot))
    };
    let value = constant(1)?;
    let value = u16::try_from(value).map_err(|_| Error::UnsupportedTag {
        context: "private opcode",
        value: value as u32,
    })?;
    let operand_kind = VmOperandKind::from_value(constant(2)?)?;
    let handler = token_at(window, 4)
        .ok_or_else(|| malformed_error!("registration of {:#06x} lacks a handler", value))?;
    Ok(DispatchEntry {
        value,
        operand_kind,
        handler,
    })
}

/// Locates the dispatch initializer: the method with the most handler registrations.
///
/// # Errors
///
/// Returns [`Error::PatternNotFound`] if no method registers handlers, or a decode error if a
/// registration carries an impossible opcode or operand kind.
pub fn locate_dispatch(
    module: &Module,
    anchors: &AnchorRegistry,
    events: &EventLog,
) -> Result<DispatchTable> {
    let pattern = anchors.get(Anchor::DispatchEntry);
    let (initializer, starts) = module
        .methods()
        .map(|method| (method, pattern.find_in(module, method)))
        .filter(|(_, starts)| !starts.is_empty())
        .max_by(|(a, x), (b, y)| x.len().cmp(&y.len()).then(b.token.cmp(&a.token)))
        .ok_or_else(|| Error::PatternNotFound(pattern.name().to_string()))?;

    let mut entries = Vec::with_capacity(starts.len());
    for start in starts {
        let window = MatchWindow {
            module,
            method: initializer,
            instructions: initializer.instructions(),
            start,
        };
        entries.push(registration(&window)?);
    }

    log::debug!(
        "dispatch initializer {} registers {} handlers",
        initializer.token,
        entries.len()
    );
    events
        .record(EventKind::AnchorMatched)
        .method(initializer.token)
        .message(format!("{} x{}", pattern.name(), entries.len()));

    Ok(DispatchTable {
        initializer: initializer.token,
        dispatch_type: initializer.declaring_type,
        entries,
    })
}

/// Classifies every registered handler.
///
/// Registrations are applied in construction order, so a value registered twice ends up with the
/// meaning of its last handler. Bare `ret` handlers are resolved through their operand kind: an
/// operand-less one is a `nop`, anything else stays a [`SpecialAction::NoBody`] whose operand is
/// consumed and dropped. Handlers no template recognises leave their value unknown.
#[must_use]
pub fn build_opcode_table(
    module: &Module,
    dispatch: &DispatchTable,
    templates: &TemplateLibrary,
    events: &EventLog,
) -> OpcodeTable {
    let mut table = OpcodeTable::new();
    for entry in &dispatch.entries {
        let classified = module
            .method(entry.handler)
            .and_then(|handler| templates.classify(module, handler));
        let Some((template, kind)) = classified else {
            log::warn!(
                "opcode {:#06x}: handler {} matches no template",
                entry.value,
                entry.handler
            );
            events
                .record(EventKind::OpcodeUnknown)
                .method(entry.handler)
                .location(u32::from(entry.value))
                .message(format!("opcode {:#06x}", entry.value));
            table.mark_unknown(entry.value, entry.handler);
            continue;
        };

        let kind = match kind {
            OpcodeKind::Special(SpecialAction::NoBody)
                if entry.operand_kind == VmOperandKind::None =>
            {
                OpcodeKind::Native(crate::assembly::Code::Nop)
            }
            other => other,
        };
        log::debug!("opcode {:#06x} -> {:?} ({})", entry.value, kind, template);
        events
            .record(EventKind::OpcodeClassified)
            .method(entry.handler)
            .location(u32::from(entry.value))
            .message(format!("{kind:?} via {template}"));
        table.insert(OpcodeTableEntry {
            value: entry.value,
            operand_kind: entry.operand_kind,
            kind,
            handler: entry.handler,
        });
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::Code,
        test::{HandlerShape, VmModuleBuilder},
    };

    #[test]
    fn dispatch_table_in_construction_order() {
        let vm = VmModuleBuilder::new().build();
        let events = EventLog::new();
        let dispatch = locate_dispatch(&vm.module, &AnchorRegistry::new(), &events).unwrap();
        assert_eq!(dispatch.initializer, vm.dispatch_initializer);
        let values: Vec<u16> = dispatch.entries.iter().map(|e| e.value).collect();
        let expected: Vec<u16> = vm.registrations.iter().map(|(_, value, _)| *value).collect();
        assert_eq!(values, expected);
        assert!(events.has(EventKind::AnchorMatched));
    }

    #[test]
    fn missing_initializer_is_pattern_not_found() {
        let module = Module::new("empty");
        let result = locate_dispatch(&module, &AnchorRegistry::new(), &EventLog::new());
        assert!(matches!(result, Err(Error::PatternNotFound(_))));
    }

    #[test]
    fn table_is_a_deterministic_function() {
        let vm = VmModuleBuilder::new().build();
        let events = EventLog::new();
        let dispatch = locate_dispatch(&vm.module, &AnchorRegistry::new(), &events).unwrap();
        let library = TemplateLibrary::new();
        let first = build_opcode_table(&vm.module, &dispatch, &library, &events);
        let second = build_opcode_table(&vm.module, &dispatch, &library, &events);
        assert_eq!(first, second);
        assert_eq!(first.unknown().count(), 0);

        for (shape, value, _) in &vm.registrations {
            assert_eq!(first.get(*value).unwrap().kind, shape.expected(), "{shape:?}");
        }
        assert_eq!(
            first.get(vm.opcode(HandlerShape::Nop).unwrap()).unwrap().kind,
            OpcodeKind::Native(Code::Nop)
        );
    }

    #[test]
    fn unknown_handler_and_duplicate_registration() {
        let vm = VmModuleBuilder::new()
            .with_handler(HandlerShape::Unrecognised, 0x0300)
            .with_handler(HandlerShape::Xor, 0x0301)
            .with_handler(HandlerShape::Unrecognised, 0x0301)
            .build();
        let events = EventLog::new();
        let dispatch = locate_dispatch(&vm.module, &AnchorRegistry::new(), &events).unwrap();
        let table = build_opcode_table(&vm.module, &dispatch, &TemplateLibrary::new(), &events);

        assert!(matches!(table.get(0x0300), Err(Error::UnknownOpcode(0x0300))));
        assert!(matches!(table.get(0x0301), Err(Error::UnknownOpcode(0x0301))));
        assert_eq!(table.unknown().count(), 2);
        assert_eq!(events.count_kind(EventKind::OpcodeUnknown), 2);
    }
}
