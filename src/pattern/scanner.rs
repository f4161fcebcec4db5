use crate::{
    metadata::{method::MethodDef, module::Module, token::Token},
    pattern::pattern::{Pattern, PatternFlags},
};

/// A match of a [`Pattern`] inside a method body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternMatch {
    /// Method containing the match
    pub method: Token,
    /// Index of the first matched instruction
    pub start: usize,
}

impl Pattern {
    /// Returns the start indices of all accepted matches in `method`.
    ///
    /// Matches never overlap. Without [`PatternFlags::ALLOW_MULTIPLE`] the scan stops at the first
    /// accepted match.
    #[must_use]
    pub fn find_in(&self, module: &Module, method: &MethodDef) -> Vec<usize> {
        let count = method.instructions().len();
        let mut found = Vec::new();
        if self.is_empty() || count < self.len() {
            return found;
        }
        let last = if self.flags().contains(PatternFlags::MATCH_ENTIRE_BODY) {
            0
        } else {
            count - self.len()
        };

        let mut start = 0;
        while start <= last {
            if self.matches_at(module, method, start) {
                found.push(start);
                if !self.flags().contains(PatternFlags::ALLOW_MULTIPLE) {
                    break;
                }
                start += self.len();
            } else {
                start += 1;
            }
        }
        found
    }

    /// Returns the first match in the module, scanning methods in token order.
    #[must_use]
    pub fn find_first(&self, module: &Module) -> Option<PatternMatch> {
        module.methods().find_map(|method| {
            self.find_in(module, method)
                .first()
                .map(|start| PatternMatch {
                    method: method.token,
                    start: *start,
                })
        })
    }

    /// Returns every match in the module, in method token order.
    #[must_use]
    pub fn find_all(&self, module: &Module) -> Vec<PatternMatch> {
        module
            .methods()
            .flat_map(|method| {
                self.find_in(module, method)
                    .into_iter()
                    .map(|start| PatternMatch {
                        method: method.token,
                        start,
                    })
            })
            .collect()
    }

    /// Returns every method of the module with at least one match.
    #[must_use]
    pub fn matching_methods(&self, module: &Module) -> Vec<Token> {
        module
            .methods()
            .filter(|method| !self.find_in(module, method).is_empty())
            .map(|method| method.token)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::{Code, Instruction, Operand},
        metadata::method::{MethodAttributes, MethodBody, MethodSig},
        pattern::Slot,
    };

    fn pair() -> Vec<Instruction> {
        vec![
            Instruction::new(Code::LdcI4, Operand::Int32(1)),
            Instruction::simple(Code::Pop),
        ]
    }

    fn sample() -> (Module, Token, Token) {
        let mut module = Module::new("test");
        let ty = module.add_type("", "T");
        let mut body = pair();
        body.extend(pair());
        body.push(Instruction::simple(Code::Ret));
        let first = module.add_method(
            ty,
            "A",
            MethodAttributes::STATIC,
            MethodSig::default(),
            Some(MethodBody::new(body)),
        );
        let second = module.add_method(
            ty,
            "B",
            MethodAttributes::STATIC,
            MethodSig::default(),
            Some(MethodBody::new(pair())),
        );
        (module, first, second)
    }

    #[test]
    fn single_match_per_method_by_default() {
        let (module, first, _) = sample();
        let pattern = Pattern::from_codes("pair", &[Code::LdcI4, Code::Pop]);
        let method = module.method(first).unwrap();
        assert_eq!(pattern.find_in(&module, method), vec![0]);

        let multi = pattern.with_flags(PatternFlags::ALLOW_MULTIPLE);
        assert_eq!(multi.find_in(&module, method), vec![0, 2]);
    }

    #[test]
    fn module_scans() {
        let (module, first, second) = sample();
        let pattern = Pattern::from_codes("pair", &[Code::LdcI4, Code::Pop])
            .with_flags(PatternFlags::ALLOW_MULTIPLE);
        assert_eq!(
            pattern.find_first(&module),
            Some(PatternMatch {
                method: first,
                start: 0
            })
        );
        assert_eq!(pattern.find_all(&module).len(), 3);
        assert_eq!(pattern.matching_methods(&module), vec![first, second]);

        let whole = Pattern::from_codes("pair", &[Code::LdcI4, Code::Pop])
            .with_flags(PatternFlags::MATCH_ENTIRE_BODY);
        assert_eq!(whole.matching_methods(&module), vec![second]);
    }

    #[test]
    fn no_match() {
        let (module, _, _) = sample();
        let pattern = Pattern::new("none", [Slot::Op(Code::Throw)]);
        assert!(pattern.find_first(&module).is_none());
        assert!(pattern.find_all(&module).is_empty());
    }
}
