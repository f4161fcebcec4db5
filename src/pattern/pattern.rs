use std::{fmt, sync::Arc};

use bitflags::bitflags;

use crate::{
    assembly::{Code, Family, Instruction},
    metadata::{method::MethodDef, module::Module},
};

bitflags! {
    /// Matching behaviour of a [`Pattern`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PatternFlags: u8 {
        /// The pattern must cover the whole method body, starting at index zero
        const MATCH_ENTIRE_BODY = 0x01;
        /// Keep searching a method after the first accepted match
        const ALLOW_MULTIPLE = 0x02;
        /// Any load-constant form matches any other
        const INTERCHANGE_LDC = 0x04;
        /// Any load-local form matches any other
        const INTERCHANGE_LDLOC = 0x08;
        /// Any store-local form matches any other
        const INTERCHANGE_STLOC = 0x10;
        /// Any load-argument form matches any other
        const INTERCHANGE_LDARG = 0x20;
    }
}

/// One position of a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Matches this instruction (or a family member when the pattern allows interchange)
    Op(Code),
    /// Matches any instruction
    Any,
}

impl From<Code> for Slot {
    fn from(code: Code) -> Self {
        Slot::Op(code)
    }
}

/// The candidate a verifier inspects: the full instruction list of `method` and the index at
/// which the pattern's first slot matched.
#[derive(Clone, Copy)]
pub struct MatchWindow<'a> {
    /// Module owning the method, for resolving operands
    pub module: &'a Module,
    /// Method being scanned
    pub method: &'a MethodDef,
    /// All instructions of the method
    pub instructions: &'a [Instruction],
    /// Index of the first matched instruction
    pub start: usize,
}

impl<'a> MatchWindow<'a> {
    /// Instruction matched by pattern slot `slot`.
    #[must_use]
    pub fn at(&self, slot: usize) -> Option<&'a Instruction> {
        self.instructions.get(self.start + slot)
    }

    /// Instructions from the match start to the end of the method.
    #[must_use]
    pub fn rest(&self) -> &'a [Instruction] {
        self.instructions.get(self.start..).unwrap_or(&[])
    }
}

/// Verification predicate run after every slot matched.
pub type Verifier = Arc<dyn Fn(&MatchWindow<'_>) -> bool + Send + Sync>;

/// An instruction shape.
///
/// Patterns are built once and then reused across the whole module scan. The slot sequence is
/// checked positionally; the optional verifier then inspects operands (callees, constants,
/// fields) of the candidate window.
///
/// # Examples
///
/// ```rust
/// use dotdevirt::assembly::Code;
/// use dotdevirt::pattern::{Pattern, PatternFlags, Slot};
///
/// let pattern = Pattern::new("PushConstant", [Slot::Op(Code::LdcI4), Slot::Any, Slot::Op(Code::Ret)])
///     .with_flags(PatternFlags::INTERCHANGE_LDC);
/// assert_eq!(pattern.len(), 3);
/// ```
#[derive(Clone)]
pub struct Pattern {
    name: String,
    slots: Vec<Slot>,
    flags: PatternFlags,
    verifier: Option<Verifier>,
}

impl Pattern {
    /// Creates a pattern without flags or verifier.
    #[must_use]
    pub fn new(name: &str, slots: impl Into<Vec<Slot>>) -> Self {
        Pattern {
            name: name.to_string(),
            slots: slots.into(),
            flags: PatternFlags::empty(),
            verifier: None,
        }
    }

    /// Creates a pattern of exact opcodes.
    #[must_use]
    pub fn from_codes(name: &str, codes: &[Code]) -> Self {
        Self::new(name, codes.iter().copied().map(Slot::Op).collect::<Vec<_>>())
    }

    /// Sets the pattern flags.
    #[must_use]
    pub fn with_flags(mut self, flags: PatternFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Attaches a verification predicate.
    #[must_use]
    pub fn verify_with<F>(mut self, verifier: F) -> Self
    where
        F: Fn(&MatchWindow<'_>) -> bool + Send + Sync + 'static,
    {
        self.verifier = Some(Arc::new(verifier));
        self
    }

    /// Pattern name, used in diagnostics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` for a pattern without slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The slots.
    #[must_use]
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// The flags.
    #[must_use]
    pub fn flags(&self) -> PatternFlags {
        self.flags
    }

    fn interchangeable(&self, expected: Code, actual: Code) -> bool {
        let Some(family) = expected.family() else {
            return false;
        };
        if actual.family() != Some(family) {
            return false;
        }
        let flag = match family {
            Family::LoadConstant => PatternFlags::INTERCHANGE_LDC,
            Family::LoadLocal => PatternFlags::INTERCHANGE_LDLOC,
            Family::StoreLocal => PatternFlags::INTERCHANGE_STLOC,
            Family::LoadArgument => PatternFlags::INTERCHANGE_LDARG,
        };
        self.flags.contains(flag)
    }

    fn slot_matches(&self, slot: Slot, instruction: &Instruction) -> bool {
        match slot {
            Slot::Any => true,
            Slot::Op(code) => code == instruction.code || self.interchangeable(code, instruction.code),
        }
    }

    /// Tests the pattern against `method` starting at instruction `start`.
    ///
    /// Methods without a body never match.
    #[must_use]
    pub fn matches_at(&self, module: &Module, method: &MethodDef, start: usize) -> bool {
        let Some(body) = method.body.as_ref() else {
            return false;
        };
        let instructions = body.instructions.as_slice();
        if self.flags.contains(PatternFlags::MATCH_ENTIRE_BODY)
            && (start != 0 || instructions.len() != self.slots.len())
        {
            return false;
        }
        let Some(window) = start
            .checked_add(self.slots.len())
            .and_then(|end| instructions.get(start..end))
        else {
            return false;
        };
        if !self
            .slots
            .iter()
            .zip(window)
            .all(|(slot, instruction)| self.slot_matches(*slot, instruction))
        {
            return false;
        }
        match &self.verifier {
            Some(verifier) => verifier(&MatchWindow {
                module,
                method,
                instructions,
                start,
            }),
            None => true,
        }
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pattern")
            .field("name", &self.name)
            .field("slots", &self.slots)
            .field("flags", &self.flags)
            .field("verified", &self.verifier.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::Operand,
        metadata::{
            method::{MethodAttributes, MethodBody, MethodSig},
            token::Token,
        },
    };

    fn module_with(body: Vec<Instruction>) -> (Module, Token) {
        let mut module = Module::new("test");
        let ty = module.add_type("", "T");
        let method = module.add_method(
            ty,
            "M",
            MethodAttributes::STATIC,
            MethodSig::default(),
            Some(MethodBody::new(body)),
        );
        (module, method)
    }

    #[test]
    fn exact_and_wildcard() {
        let (module, token) = module_with(vec![
            Instruction::simple(Code::Ldarg0),
            Instruction::new(Code::LdcI4, Operand::Int32(9)),
            Instruction::simple(Code::Add),
            Instruction::simple(Code::Ret),
        ]);
        let method = module.method(token).unwrap();

        let pattern = Pattern::new("p", [Slot::Op(Code::LdcI4), Slot::Any, Slot::Op(Code::Ret)]);
        assert!(pattern.matches_at(&module, method, 1));
        assert!(!pattern.matches_at(&module, method, 0));
        assert!(!pattern.matches_at(&module, method, 2));
    }

    #[test]
    fn order_sensitive() {
        let (module, token) = module_with(vec![
            Instruction::simple(Code::Add),
            Instruction::simple(Code::Sub),
        ]);
        let method = module.method(token).unwrap();
        assert!(Pattern::from_codes("p", &[Code::Add, Code::Sub]).matches_at(&module, method, 0));
        assert!(!Pattern::from_codes("p", &[Code::Sub, Code::Add]).matches_at(&module, method, 0));
    }

    #[test]
    fn interchange_requires_flag() {
        let (module, token) = module_with(vec![
            Instruction::simple(Code::LdcI43),
            Instruction::simple(Code::Stloc1),
        ]);
        let method = module.method(token).unwrap();

        let strict = Pattern::from_codes("p", &[Code::LdcI4, Code::Stloc]);
        assert!(!strict.matches_at(&module, method, 0));

        let ldc_only = strict.clone().with_flags(PatternFlags::INTERCHANGE_LDC);
        assert!(!ldc_only.matches_at(&module, method, 0));

        let both = strict.with_flags(PatternFlags::INTERCHANGE_LDC | PatternFlags::INTERCHANGE_STLOC);
        assert!(both.matches_at(&module, method, 0));
    }

    #[test]
    fn entire_body() {
        let (module, token) = module_with(vec![
            Instruction::simple(Code::Nop),
            Instruction::simple(Code::Ret),
        ]);
        let method = module.method(token).unwrap();
        let partial = Pattern::from_codes("p", &[Code::Ret]);
        assert!(partial.matches_at(&module, method, 1));
        let pinned = partial.with_flags(PatternFlags::MATCH_ENTIRE_BODY);
        assert!(!pinned.matches_at(&module, method, 1));
        let whole = Pattern::from_codes("p", &[Code::Nop, Code::Ret])
            .with_flags(PatternFlags::MATCH_ENTIRE_BODY);
        assert!(whole.matches_at(&module, method, 0));
    }

    #[test]
    fn verifier_rejects_wrong_operand() {
        let (module, token) = module_with(vec![
            Instruction::new(Code::LdcI4, Operand::Int32(7)),
            Instruction::simple(Code::Ret),
        ]);
        let method = module.method(token).unwrap();
        let wants = |value: i64| {
            Pattern::from_codes("p", &[Code::LdcI4, Code::Ret])
                .verify_with(move |w| w.at(0).and_then(Instruction::ldc_value) == Some(value))
        };
        assert!(wants(7).matches_at(&module, method, 0));
        assert!(!wants(8).matches_at(&module, method, 0));
    }

    #[test]
    fn missing_body_never_matches() {
        let mut module = Module::new("test");
        let ty = module.add_type("", "T");
        let token = module.add_method(ty, "M", MethodAttributes::STATIC, MethodSig::default(), None);
        let method = module.method(token).unwrap();
        assert!(!Pattern::new("p", Vec::<Slot>::new()).matches_at(&module, method, 0));
    }
}
