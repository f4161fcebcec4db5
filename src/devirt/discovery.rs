//! Method discovery.
//!
//! Virtualized methods keep their signature but their body is reduced to a call stub handing an
//! encrypted key string and the boxed arguments to the dispatcher's entry method. Discovery finds
//! every stub, the dispatcher's method-crypto key and the resolution stream the decoded keys index
//! into.

use std::sync::Arc;

use crate::{
    assembly::Instruction,
    crypto::{ByteTransform, CipherStream, KeyCodec},
    devirt::{
        anchors::{stub_entry_call, token_at, Anchor, AnchorRegistry},
        events::{EventKind, EventLog},
        method::VirtualizedMethod,
    },
    metadata::{module::Module, token::Token},
    pattern::MatchWindow,
    Error, Result,
};

/// Everything discovery recovers.
#[derive(Debug, Clone)]
pub struct Discovery {
    /// The dispatcher entry method every stub calls
    pub entry: Token,
    /// Type owning the entry method and the key decoder
    pub entry_type: Token,
    /// Constant mixed into every method key
    pub crypto_key: i64,
    /// Stream of method entries
    pub resolution: CipherStream,
    /// One method per stub, in stub token order
    pub methods: Vec<VirtualizedMethod>,
}

/// Opens the resource stream whose initializer stores into a static field of `owner`.
///
/// # Errors
///
/// Returns [`Error::PatternNotFound`] if `owner` initializes no resource stream, or a decode error
/// if the resource it names is missing.
pub fn open_resource_stream(
    module: &Module,
    anchors: &AnchorRegistry,
    owner: Token,
    transform: Arc<dyn ByteTransform>,
) -> Result<CipherStream> {
    let pattern = anchors.get(Anchor::ResourceStreamInit);
    let (method, start) = pattern
        .find_all(module)
        .into_iter()
        .find_map(|hit| {
            module
                .method(hit.method)
                .filter(|m| m.declaring_type == owner)
                .map(|m| (m, hit.start))
        })
        .ok_or_else(|| {
            let owner = module.type_name(owner).unwrap_or_else(|| owner.to_string());
            Error::PatternNotFound(format!("{} in {}", pattern.name(), owner))
        })?;

    let window = MatchWindow {
        module,
        method,
        instructions: method.instructions(),
        start,
    };
    let name = token_at(&window, 1)
        .and_then(|token| module.user_string(token))
        .ok_or_else(|| malformed_error!("stream initializer {} names no resource", method.token))?;
    let key = window
        .at(3)
        .and_then(Instruction::ldc_value)
        .and_then(|key| i32::try_from(key).ok())
        .ok_or_else(|| malformed_error!("stream initializer {} has no key", method.token))?;
    let data = module
        .resource(name)
        .ok_or_else(|| malformed_error!("resource {:?} is missing", name))?;

    log::debug!("resource stream {:?} ({} bytes, key {:#x})", name, data.len(), key);
    Ok(CipherStream::with_transform(data.to_vec(), key, transform))
}

fn crypto_key(module: &Module, anchors: &AnchorRegistry, entry_type: Token) -> Result<i64> {
    let pattern = anchors.get(Anchor::MethodKeyDecoder);
    pattern
        .find_all(module)
        .into_iter()
        .find_map(|hit| {
            let method = module.method(hit.method)?;
            if method.declaring_type != entry_type {
                return None;
            }
            method
                .instructions()
                .get(hit.start + 2)
                .and_then(Instruction::ldc_value)
        })
        .ok_or_else(|| Error::PatternNotFound(pattern.name().to_string()))
}

/// Key decoder constant and resolution stream next to the entry `entry`.
fn dispatcher_parts(
    module: &Module,
    anchors: &AnchorRegistry,
    entry: Token,
    transform: Arc<dyn ByteTransform>,
) -> Result<(Token, i64, CipherStream)> {
    let entry_type = module
        .declaring_type(entry)
        .ok_or(Error::TokenNotFound(entry))?;
    let crypto_key = crypto_key(module, anchors, entry_type)?;
    let resolution = open_resource_stream(module, anchors, entry_type, transform)?;
    Ok((entry_type, crypto_key, resolution))
}

/// Finds all call stubs and decodes their method keys.
///
/// Callees of stub-shaped methods are ranked by how many stubs call them; the first one whose
/// type also owns a key decoder and a resource stream is the dispatcher entry. Stubs calling
/// anything else are skipped with a warning. Stubs whose key does not decode are returned already
/// failed; they never abort discovery.
///
/// # Errors
///
/// Returns [`Error::PatternNotFound`] if the module has no stubs, or if no callee has a key
/// decoder and a resolution stream next to it.
pub fn discover(
    module: &Module,
    anchors: &AnchorRegistry,
    codec: &dyn KeyCodec,
    transform: Arc<dyn ByteTransform>,
    events: &EventLog,
) -> Result<Discovery> {
    let pattern = anchors.get(Anchor::VirtualCallStub);
    let mut stubs = Vec::new();
    for hit in pattern.find_all(module) {
        let Some(method) = module.method(hit.method) else {
            continue;
        };
        let instructions = method.instructions();
        let key = instructions
            .get(hit.start)
            .and_then(Instruction::token)
            .and_then(|token| module.user_string(token));
        let entry = stub_entry_call(module, method, &instructions[hit.start..]);
        if let (Some(key), Some(entry)) = (key, entry) {
            stubs.push((method.token, key.to_string(), entry));
        }
    }

    // callee -> number of stubs, in order of first appearance
    let mut candidates: Vec<(Token, usize)> = Vec::new();
    for (_, _, entry) in &stubs {
        match candidates.iter_mut().find(|(token, _)| token == entry) {
            Some((_, count)) => *count += 1,
            None => candidates.push((*entry, 1)),
        }
    }
    candidates.sort_by(|a, b| b.1.cmp(&a.1));

    let mut first_error = None;
    let mut selected = None;
    for (candidate, _) in &candidates {
        match dispatcher_parts(module, anchors, *candidate, transform.clone()) {
            Ok(parts) => {
                selected = Some((*candidate, parts));
                break;
            }
            Err(e) => {
                log::debug!("callee {} is not the dispatcher entry: {}", candidate, e);
                first_error.get_or_insert(e);
            }
        }
    }
    let Some((entry, (entry_type, crypto_key, resolution))) = selected else {
        return Err(first_error
            .unwrap_or_else(|| Error::PatternNotFound(pattern.name().to_string())));
    };
    log::info!(
        "found {} call stubs into {}, crypto key {:#x}",
        stubs.len(),
        module.member_name(entry).unwrap_or_default(),
        crypto_key
    );

    let mut methods = Vec::with_capacity(stubs.len());
    for (stub, encrypted, stub_entry) in stubs {
        if stub_entry != entry {
            log::warn!("stub {} calls a different dispatcher {}, skipped", stub, stub_entry);
            events
                .record(EventKind::Warning)
                .method(stub)
                .message(format!("calls a second dispatcher {stub_entry}"));
            continue;
        }
        let method = match codec.decode(&encrypted, crypto_key) {
            Ok(key) => {
                events
                    .record(EventKind::MethodDiscovered)
                    .method(stub)
                    .location(key)
                    .message(format!("key {encrypted:?}"));
                VirtualizedMethod::new(stub, encrypted, key)
            }
            Err(e) => {
                log::warn!("stub {}: {}", stub, e);
                events
                    .record(EventKind::MethodFailed)
                    .method(stub)
                    .message(e.to_string());
                let mut method = VirtualizedMethod::new(stub, encrypted, 0);
                method.fail(e.to_string());
                method
            }
        };
        methods.push(method);
    }

    Ok(Discovery {
        entry,
        entry_type,
        crypto_key,
        resolution,
        methods,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::HexXorCodec,
        devirt::events::Event,
        test::{HandlerShape as H, VInstr, VirtualMethodSpec, VmFixture, VmModuleBuilder},
        vm::VmOperand,
    };

    fn answer() -> VirtualMethodSpec {
        VirtualMethodSpec::new("Answer", &[], Some("System.Int32")).code(vec![
            VInstr::op(H::LdcI4, VmOperand::Int32(42)),
            VInstr::op(H::Ret, VmOperand::None),
        ])
    }

    fn discover_all(vm: &VmFixture, events: &EventLog) -> Discovery {
        discover(
            &vm.module,
            &AnchorRegistry::new(),
            &HexXorCodec,
            vm.cipher.transform(),
            events,
        )
        .unwrap()
    }

    #[test]
    fn discovers_every_stub() {
        let vm = VmModuleBuilder::new()
            .with_method(answer())
            .with_method(VirtualMethodSpec::new("Idle", &["System.String"], None).code(vec![
                VInstr::op(H::Ret, VmOperand::None),
            ]))
            .build();
        let events = EventLog::new();
        let found = discover_all(&vm, &events);

        assert_eq!(found.entry, vm.entry);
        assert_eq!(found.entry_type, vm.entry_type);
        assert_eq!(found.crypto_key, vm.crypto_key);
        let stubs: Vec<Token> = found.methods.iter().map(|m| m.stub).collect();
        assert_eq!(stubs, vm.stubs);
        for method in &found.methods {
            assert_eq!(Some(method.key), vm.key_of(method.stub));
        }
        assert_eq!(events.count_kind(EventKind::MethodDiscovered), vm.stubs.len());
        assert_eq!(events.warnings().count(), 0);
    }

    #[test]
    fn foreign_dispatcher_stub_is_skipped() {
        for vm in [
            VmModuleBuilder::new().with_method(answer()).with_decoy_stub().build(),
            VmModuleBuilder::new().with_method(answer()).with_leading_decoy_stub().build(),
        ] {
            let decoy = vm.decoy_stub.unwrap();
            let events = EventLog::new();
            let found = discover_all(&vm, &events);

            assert_eq!(found.entry, vm.entry);
            let stubs: Vec<Token> = found.methods.iter().map(|m| m.stub).collect();
            assert_eq!(stubs, vm.stubs);
            assert!(!stubs.contains(&decoy));
            let skipped: Vec<&Event> = events.filter_method(decoy).collect();
            assert_eq!(skipped.len(), 1);
            assert_eq!(skipped[0].kind, EventKind::Warning);
        }
    }

    #[test]
    fn foreign_dispatcher_alone_is_not_an_entry() {
        let vm = VmModuleBuilder::new().with_decoy_stub().build();
        let result = discover(
            &vm.module,
            &AnchorRegistry::new(),
            &HexXorCodec,
            vm.cipher.transform(),
            &EventLog::new(),
        );
        assert!(matches!(result, Err(Error::PatternNotFound(_))));
    }

    #[test]
    fn bad_key_fails_only_that_stub() {
        let vm = VmModuleBuilder::new()
            .with_method(answer())
            .with_garbage_key_stub()
            .build();
        let found = discover(
            &vm.module,
            &AnchorRegistry::new(),
            &HexXorCodec,
            vm.cipher.transform(),
            &EventLog::new(),
        )
        .unwrap();
        assert_eq!(found.methods.iter().filter(|m| m.is_failed()).count(), 1);
        assert!(found.methods.iter().filter(|m| !m.is_failed()).count() >= 1);
    }

    #[test]
    fn module_without_stubs() {
        let module = Module::new("plain");
        let result = discover(
            &module,
            &AnchorRegistry::new(),
            &HexXorCodec,
            Arc::new(crate::crypto::RollingXor),
            &EventLog::new(),
        );
        assert!(matches!(result, Err(Error::PatternNotFound(_))));
    }

    #[test]
    fn streams_are_found_per_owner() {
        let vm = VmModuleBuilder::new().build();
        let anchors = AnchorRegistry::new();
        let bytecode =
            open_resource_stream(&vm.module, &anchors, vm.vm_type, vm.cipher.transform()).unwrap();
        let resolution =
            open_resource_stream(&vm.module, &anchors, vm.entry_type, vm.cipher.transform()).unwrap();
        assert_eq!(bytecode.key(), vm.bytecode_key);
        assert_eq!(resolution.key(), vm.resolution_key);
        assert!(open_resource_stream(
            &vm.module,
            &anchors,
            vm.stub_type,
            vm.cipher.transform()
        )
        .is_err());
    }
}
