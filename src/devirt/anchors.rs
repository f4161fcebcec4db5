//! Anchor shapes located in the protected module.
//!
//! Names are stripped from every VM type and member, so each structural element the pipeline
//! depends on is recognised by instruction shape alone. The registry holds one [`Pattern`] per
//! [`Anchor`], iterated in declaration order; callers may override any of them for builds whose
//! code generation differs.

use strum::{EnumCount, EnumIter, IntoEnumIterator};

use crate::{
    assembly::{Code, Instruction},
    metadata::{method::MethodDef, module::Module, token::Token},
    pattern::{MatchWindow, Pattern, PatternFlags, Slot},
};

/// Structural anchors of the VM runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter, EnumCount)]
pub enum Anchor {
    /// One `Register(opcode, operandKind, new Handler(this, &handler))` call of the dispatch
    /// initializer.
    DispatchEntry,
    /// `new VmStream(GetExecutingAssembly().GetManifestResourceStream(name), key)` stored into a
    /// static field.
    ResourceStreamInit,
    /// The dispatcher's method key decoder, `ParseHex(key) ^ CRYPTO_KEY`.
    MethodKeyDecoder,
    /// A call stub: `Entry("encrypted key", new object[n] { ... })`.
    VirtualCallStub,
    /// An instance reader reassembling a scrambled integer from a byte buffer field.
    ScrambledIntReader,
}

impl Anchor {
    /// Anchor name used in diagnostics.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Anchor::DispatchEntry => "DispatchEntry",
            Anchor::ResourceStreamInit => "ResourceStreamInit",
            Anchor::MethodKeyDecoder => "MethodKeyDecoder",
            Anchor::VirtualCallStub => "VirtualCallStub",
            Anchor::ScrambledIntReader => "ScrambledIntReader",
        }
    }

    /// The shape recognised by default.
    #[must_use]
    pub fn default_pattern(self) -> Pattern {
        match self {
            Anchor::DispatchEntry => Pattern::from_codes(
                self.name(),
                &[
                    Code::Ldarg0,
                    Code::LdcI4,
                    Code::LdcI4,
                    Code::Ldarg0,
                    Code::Ldftn,
                    Code::Newobj,
                    Code::Call,
                ],
            )
            .with_flags(PatternFlags::ALLOW_MULTIPLE | PatternFlags::INTERCHANGE_LDC)
            .verify_with(|w| {
                let owner = w.method.declaring_type;
                let handler = method_at(w, 4).is_some_and(|h| h.declaring_type == owner);
                let register = method_at(w, 6)
                    .is_some_and(|r| r.declaring_type == owner && r.signature.params.len() == 3);
                handler && register
            }),
            Anchor::ResourceStreamInit => Pattern::from_codes(
                self.name(),
                &[
                    Code::Call,
                    Code::Ldstr,
                    Code::Callvirt,
                    Code::LdcI4,
                    Code::Newobj,
                    Code::Stsfld,
                ],
            )
            .with_flags(PatternFlags::INTERCHANGE_LDC)
            .verify_with(|w| {
                member_ends_with(w, 2, "::GetManifestResourceStream")
                    && token_at(w, 5)
                        .and_then(|field| w.module.field(field))
                        .is_some_and(|f| f.declaring_type == w.method.declaring_type)
            }),
            Anchor::MethodKeyDecoder => Pattern::new(
                self.name(),
                [
                    Slot::Op(Code::Ldarg0),
                    Slot::Op(Code::Call),
                    Slot::Any,
                    Slot::Op(Code::Xor),
                    Slot::Op(Code::Ret),
                ],
            )
            .with_flags(PatternFlags::MATCH_ENTIRE_BODY)
            .verify_with(|w| {
                let decoder = w.method.is_static() && w.method.signature.params.len() == 1;
                let parser = method_at(w, 1).is_some_and(|p| {
                    p.is_static() && p.signature.params.len() == 1 && p.signature.returns_value()
                });
                let constant = w.at(2).and_then(Instruction::ldc_value).is_some();
                decoder && parser && constant
            }),
            Anchor::VirtualCallStub => {
                Pattern::from_codes(self.name(), &[Code::Ldstr, Code::LdcI4, Code::Newarr])
                    .with_flags(PatternFlags::INTERCHANGE_LDC)
                    .verify_with(|w| stub_entry_call(w.module, w.method, w.rest()).is_some())
            }
            Anchor::ScrambledIntReader => {
                Pattern::from_codes(self.name(), &[Code::Ldarg0, Code::Ldfld]).verify_with(|w| {
                    let buffer = token_at(w, 1).is_some_and(|field| is_array_field(w.module, field));
                    let sig = &w.method.signature;
                    let shape = sig.has_this
                        && sig.params.is_empty()
                        && sig
                            .ret
                            .and_then(|ret| w.module.type_name(ret))
                            .is_some_and(|name| {
                                matches!(
                                    name.as_str(),
                                    "System.UInt16" | "System.Int32" | "System.UInt32"
                                )
                            });
                    let reads_bytes = w.instructions.iter().any(|i| i.code == Code::LdelemU1);
                    buffer && shape && reads_bytes
                })
            }
        }
    }
}

pub(crate) fn token_at(window: &MatchWindow<'_>, slot: usize) -> Option<Token> {
    window.at(slot).and_then(Instruction::token)
}

pub(crate) fn method_at<'a>(window: &MatchWindow<'a>, slot: usize) -> Option<&'a MethodDef> {
    token_at(window, slot).and_then(|token| window.module.method(token))
}

pub(crate) fn member_ends_with(window: &MatchWindow<'_>, slot: usize, suffix: &str) -> bool {
    token_at(window, slot)
        .and_then(|token| window.module.member_name(token))
        .is_some_and(|name| name.ends_with(suffix))
}

pub(crate) fn is_array_field(module: &Module, field: Token) -> bool {
    module
        .field(field)
        .and_then(|f| module.type_name(f.field_type))
        .is_some_and(|name| name.ends_with("[]"))
}

/// Returns the dispatcher entry method called by a stub body: a static method of another type
/// taking the key and the argument array.
pub(crate) fn stub_entry_call(
    module: &Module,
    stub: &MethodDef,
    instructions: &[Instruction],
) -> Option<Token> {
    instructions
        .iter()
        .filter(|i| i.code == Code::Call)
        .filter_map(Instruction::token)
        .find(|token| {
            module.method(*token).is_some_and(|entry| {
                entry.is_static()
                    && entry.signature.params.len() == 2
                    && entry.signature.returns_value()
                    && entry.declaring_type != stub.declaring_type
            })
        })
}

/// Anchor patterns in declaration order.
#[derive(Debug, Clone)]
pub struct AnchorRegistry {
    patterns: Vec<Pattern>,
}

impl Default for AnchorRegistry {
    fn default() -> Self {
        AnchorRegistry {
            patterns: Anchor::iter().map(Anchor::default_pattern).collect(),
        }
    }
}

impl AnchorRegistry {
    /// Creates a registry with the default shapes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the pattern of `anchor`.
    #[must_use]
    pub fn with_pattern(mut self, anchor: Anchor, pattern: Pattern) -> Self {
        self.patterns[anchor as usize] = pattern;
        self
    }

    /// The pattern of `anchor`.
    #[must_use]
    pub fn get(&self, anchor: Anchor) -> &Pattern {
        &self.patterns[anchor as usize]
    }

    /// Anchors and their patterns in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (Anchor, &Pattern)> {
        Anchor::iter().zip(self.patterns.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test::{HandlerShape as H, VInstr, VirtualMethodSpec, VmModuleBuilder},
        vm::VmOperand,
    };

    fn with_stub() -> VmModuleBuilder {
        VmModuleBuilder::new().with_method(
            VirtualMethodSpec::new("Run", &["System.Int32"], None)
                .code(vec![VInstr::op(H::Ret, VmOperand::None)]),
        )
    }

    #[test]
    fn registry_order_and_override() {
        let registry = AnchorRegistry::new();
        let names: Vec<&str> = registry
            .iter()
            .map(|(anchor, pattern)| {
                assert_eq!(anchor.name(), pattern.name());
                pattern.name()
            })
            .collect();
        assert_eq!(names.len(), Anchor::COUNT);
        assert_eq!(names[0], "DispatchEntry");

        let custom = Pattern::from_codes("custom", &[Code::Nop]);
        let registry = registry.with_pattern(Anchor::VirtualCallStub, custom);
        assert_eq!(registry.get(Anchor::VirtualCallStub).name(), "custom");
        assert_eq!(registry.get(Anchor::DispatchEntry).name(), "DispatchEntry");
    }

    #[test]
    fn default_anchors_locate_fixture_elements() {
        let vm = with_stub().build();
        let registry = AnchorRegistry::new();

        let entries = registry.get(Anchor::DispatchEntry).find_all(&vm.module);
        assert!(!entries.is_empty());
        assert!(entries.iter().all(|m| m.method == vm.dispatch_initializer));

        let streams = registry.get(Anchor::ResourceStreamInit).find_all(&vm.module);
        assert_eq!(streams.len(), 2);

        let decoder = registry.get(Anchor::MethodKeyDecoder).matching_methods(&vm.module);
        assert_eq!(decoder, vec![vm.key_decoder]);

        let stubs = registry.get(Anchor::VirtualCallStub).matching_methods(&vm.module);
        assert_eq!(stubs, vm.stubs);
    }

    #[test]
    fn stub_shape_ignores_who_is_called() {
        let vm = with_stub().with_decoy_stub().build();
        let stubs = AnchorRegistry::new()
            .get(Anchor::VirtualCallStub)
            .matching_methods(&vm.module);
        assert_eq!(stubs.len(), vm.stubs.len() + 1);
        assert!(stubs.contains(&vm.decoy_stub.unwrap()));
    }

    #[test]
    fn stub_calling_a_void_method_is_rejected() {
        let mut vm = with_stub().build();
        let stub = vm.stubs[0];
        let ty = vm.module.add_type("App", "Sink");
        let string = vm.module.import_type("System.String");
        let array = vm.module.import_type("System.Object[]");
        let sink = vm.module.add_method(
            ty,
            "Consume",
            crate::metadata::method::MethodAttributes::STATIC,
            crate::metadata::method::MethodSig::new_static(vec![string, array], None),
            None,
        );
        let mut body = vm.module.method(stub).unwrap().body.clone().unwrap();
        for instruction in &mut body.instructions {
            if instruction.code == Code::Call {
                *instruction = Instruction::with_token(Code::Call, sink);
            }
        }
        vm.module.replace_body(stub, body).unwrap();

        let stubs = AnchorRegistry::new()
            .get(Anchor::VirtualCallStub)
            .matching_methods(&vm.module);
        assert!(!stubs.contains(&stub));
    }
}
