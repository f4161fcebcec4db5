//! Handler templates: instruction shapes of VM handler bodies and the opcode each one implements.
//!
//! Handlers are instance methods of the VM type taking the decoded operand as their only
//! parameter. They manipulate the VM's value stack through two helper methods, recognised by
//! signature alone:
//!
//! - pop/peek: instance, no parameters, returns a value
//! - push: instance, one parameter, returns nothing
//!
//! Templates are tried in library order and the first verified match decides the handler's
//! meaning.

use crate::{
    assembly::{Code, Instruction},
    devirt::{
        anchors::{member_ends_with, method_at, token_at},
        opcodes::{OpcodeKind, SpecialAction},
    },
    metadata::{method::MethodDef, module::Module},
    pattern::{MatchWindow, Pattern, PatternFlags, Slot},
};

/// Framework members whose result a resolved-push handler pushes.
const PUSH_MEMBERS: &[(&str, Code)] = &[
    ("System.Convert::ToInt32", Code::LdcI4),
    ("System.Convert::ToInt64", Code::LdcI8),
    ("System.Convert::ToSingle", Code::LdcR4),
    ("System.Convert::ToDouble", Code::LdcR8),
    ("System.Reflection.Module::ResolveString", Code::Ldstr),
    ("System.Reflection.Module::ResolveType", Code::Ldtoken),
    ("System.Reflection.Module::ResolveField", Code::Ldsfld),
];

/// Framework members a resolved-invoke handler applies to a resolved member.
const INVOKE_MEMBERS: &[(&str, Code)] = &[
    ("System.Reflection.FieldInfo::GetValue", Code::Ldfld),
    ("System.Reflection.FieldInfo::SetValue", Code::Stfld),
    ("System.Reflection.MethodBase::Invoke", Code::Call),
    ("System.Reflection.MethodInfo::Invoke", Code::Callvirt),
    ("System.Reflection.ConstructorInfo::Invoke", Code::Newobj),
    ("System.Array::CreateInstance", Code::Newarr),
    ("System.Type::IsInstanceOfType", Code::Isinst),
    ("System.Convert::ChangeType", Code::Castclass),
    ("System.Runtime.CompilerServices.RuntimeHelpers::GetObjectValue", Code::Box),
];

/// How a matched template determines the opcode's meaning.
#[derive(Debug, Clone, Copy)]
pub enum TemplateOutcome {
    /// Always this native instruction
    Native(Code),
    /// Always this VM action
    Special(SpecialAction),
    /// The handler itself executes the native instruction at `slot`; short forms are widened
    Marker(usize),
    /// The framework member called at `slot` selects the instruction from `members`
    Framework {
        /// Pattern slot of the call
        slot: usize,
        /// Member full name to native instruction
        members: &'static [(&'static str, Code)],
    },
}

/// A handler shape and its meaning.
#[derive(Debug, Clone)]
pub struct HandlerTemplate {
    /// The body shape; matched against the whole handler body
    pub pattern: Pattern,
    /// Meaning of a matching handler
    pub outcome: TemplateOutcome,
}

impl HandlerTemplate {
    /// Creates a template. The pattern is pinned to the whole handler body.
    #[must_use]
    pub fn new(pattern: Pattern, outcome: TemplateOutcome) -> Self {
        let flags = pattern.flags() | PatternFlags::MATCH_ENTIRE_BODY;
        HandlerTemplate {
            pattern: pattern.with_flags(flags),
            outcome,
        }
    }

    /// Template name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.pattern.name()
    }

    /// Classifies `handler` if its body has this template's shape.
    #[must_use]
    pub fn classify(&self, module: &Module, handler: &MethodDef) -> Option<OpcodeKind> {
        if !self.pattern.matches_at(module, handler, 0) {
            return None;
        }
        let instructions = handler.instructions();
        match self.outcome {
            TemplateOutcome::Native(code) => Some(OpcodeKind::Native(code)),
            TemplateOutcome::Special(action) => Some(OpcodeKind::Special(action)),
            TemplateOutcome::Marker(slot) => instructions
                .get(slot)
                .map(|i| OpcodeKind::Native(i.code.long_form())),
            TemplateOutcome::Framework { slot, members } => {
                let name = instructions
                    .get(slot)
                    .and_then(Instruction::token)
                    .and_then(|token| module.member_name(token))?;
                members
                    .iter()
                    .find(|(member, _)| *member == name)
                    .map(|(_, code)| OpcodeKind::Native(*code))
            }
        }
    }
}

fn is_pop_helper(window: &MatchWindow<'_>, slot: usize) -> bool {
    method_at(window, slot).is_some_and(|m| {
        m.declaring_type == window.method.declaring_type
            && m.signature.has_this
            && m.signature.params.is_empty()
            && m.signature.returns_value()
    })
}

fn is_push_helper(window: &MatchWindow<'_>, slot: usize) -> bool {
    method_at(window, slot).is_some_and(|m| {
        m.declaring_type == window.method.declaring_type
            && m.signature.has_this
            && m.signature.params.len() == 1
            && !m.signature.returns_value()
    })
}

/// Instance helper of the VM type taking the unboxed filter verdict.
fn is_filter_verdict(window: &MatchWindow<'_>, slot: usize) -> bool {
    method_at(window, slot).is_some_and(|m| {
        m.declaring_type == window.method.declaring_type
            && m.signature.has_this
            && !m.signature.returns_value()
            && m.signature.params.len() == 1
            && window
                .module
                .type_name(m.signature.params[0])
                .is_some_and(|name| name == "System.Int32")
    })
}

fn is_framework_member(
    window: &MatchWindow<'_>,
    slot: usize,
    members: &[(&str, Code)],
) -> bool {
    token_at(window, slot)
        .and_then(|token| window.module.member_name(token))
        .is_some_and(|name| members.iter().any(|(member, _)| *member == name))
}

fn is_region_stack_call(window: &MatchWindow<'_>, slot: usize, method: &str) -> bool {
    token_at(window, slot)
        .and_then(|token| window.module.member_name(token))
        .is_some_and(|name| {
            name.starts_with("System.Collections.Generic.Stack`1")
                && name.ends_with(&format!("::{method}"))
        })
}

fn code_at(window: &MatchWindow<'_>, slot: usize, test: fn(Code) -> bool) -> bool {
    window.at(slot).is_some_and(|i| test(i.code))
}

/// Priority-ordered template library.
#[derive(Debug, Clone)]
pub struct TemplateLibrary {
    templates: Vec<HandlerTemplate>,
}

impl Default for TemplateLibrary {
    fn default() -> Self {
        use Code::*;
        use Slot::{Any, Op};

        let t = HandlerTemplate::new;
        let templates = vec![
            t(
                Pattern::from_codes("EazCall", &[Ldarg0, Ldarg1, Call, Ret]).verify_with(|w| {
                    method_at(w, 2).is_some_and(|callee| {
                        callee.is_static()
                            && callee.signature.params.len() == 2
                            && callee.declaring_type != w.method.declaring_type
                    })
                }),
                TemplateOutcome::Special(SpecialAction::EazCall),
            ),
            t(
                Pattern::from_codes(
                    "StartHomomorphic",
                    &[Ldarg0, Ldfld, Ldarg1, UnboxAny, Callvirt, Ret],
                )
                .verify_with(|w| is_region_stack_call(w, 4, "Push")),
                TemplateOutcome::Special(SpecialAction::StartHomomorphic),
            ),
            t(
                Pattern::from_codes("EndHomomorphic", &[Ldarg0, Ldfld, Callvirt, Pop, Ret])
                    .verify_with(|w| is_region_stack_call(w, 2, "Pop")),
                TemplateOutcome::Special(SpecialAction::EndHomomorphic),
            ),
            t(
                Pattern::from_codes("NoBody", &[Ret]),
                TemplateOutcome::Special(SpecialAction::NoBody),
            ),
            t(
                Pattern::new(
                    "BinaryOperator",
                    [
                        Op(Ldarg0),
                        Op(Ldarg0),
                        Op(Call),
                        Op(Ldarg0),
                        Op(Call),
                        Any,
                        Op(Call),
                        Op(Ret),
                    ],
                )
                .verify_with(|w| {
                    is_pop_helper(w, 2)
                        && is_pop_helper(w, 4)
                        && code_at(w, 5, Code::is_binary_operator)
                        && is_push_helper(w, 6)
                }),
                TemplateOutcome::Marker(5),
            ),
            t(
                Pattern::new(
                    "UnaryOperator",
                    [Op(Ldarg0), Op(Ldarg0), Op(Call), Any, Op(Call), Op(Ret)],
                )
                .verify_with(|w| {
                    is_pop_helper(w, 2) && code_at(w, 3, Code::is_unary_operator) && is_push_helper(w, 4)
                }),
                TemplateOutcome::Marker(3),
            ),
            t(
                Pattern::from_codes("Duplicate", &[Ldarg0, Ldarg0, Call, Call, Ret])
                    .verify_with(|w| is_pop_helper(w, 2) && is_push_helper(w, 3)),
                TemplateOutcome::Native(Dup),
            ),
            t(
                Pattern::from_codes("Discard", &[Ldarg0, Call, Pop, Ret])
                    .verify_with(|w| is_pop_helper(w, 1)),
                TemplateOutcome::Native(Pop),
            ),
            t(
                Pattern::from_codes("Return", &[Ldarg0, LdcI4, Stfld, Ret])
                    .with_flags(PatternFlags::INTERCHANGE_LDC)
                    .verify_with(|w| w.at(1).and_then(Instruction::ldc_value) == Some(1)),
                TemplateOutcome::Native(Ret),
            ),
            t(
                Pattern::from_codes("Throw", &[Ldarg0, Call, Castclass, Throw])
                    .verify_with(|w| is_pop_helper(w, 1)),
                TemplateOutcome::Native(Throw),
            ),
            t(
                Pattern::from_codes("Branch", &[Ldarg0, Ldarg1, UnboxAny, Stfld, Ret]),
                TemplateOutcome::Native(Br),
            ),
            t(
                Pattern::new(
                    "BooleanBranch",
                    [
                        Op(Ldarg0),
                        Op(Call),
                        Any,
                        Op(Ret),
                        Op(Ldarg0),
                        Op(Ldarg1),
                        Op(UnboxAny),
                        Op(Stfld),
                        Op(Ret),
                    ],
                )
                .verify_with(|w| is_pop_helper(w, 1) && code_at(w, 2, Code::is_boolean_branch)),
                TemplateOutcome::Marker(2),
            ),
            t(
                Pattern::new(
                    "CompareBranch",
                    [
                        Op(Ldarg0),
                        Op(Call),
                        Op(Ldarg0),
                        Op(Call),
                        Any,
                        Op(Ret),
                        Op(Ldarg0),
                        Op(Ldarg1),
                        Op(UnboxAny),
                        Op(Stfld),
                        Op(Ret),
                    ],
                )
                .verify_with(|w| {
                    is_pop_helper(w, 1) && is_pop_helper(w, 3) && code_at(w, 4, Code::is_compare_branch)
                }),
                TemplateOutcome::Marker(4),
            ),
            t(
                Pattern::from_codes(
                    "Switch",
                    &[Ldarg0, Ldarg1, Castclass, Ldarg0, Call, UnboxAny, LdelemI4, Stfld, Ret],
                )
                .verify_with(|w| is_pop_helper(w, 4)),
                TemplateOutcome::Native(Switch),
            ),
            t(
                Pattern::from_codes("Leave", &[Ldarg0, Ldarg1, UnboxAny, Call, Ret]).verify_with(
                    |w| {
                        method_at(w, 3).is_some_and(|m| {
                            m.declaring_type == w.method.declaring_type
                                && m.signature.has_this
                                && m.signature.params.len() == 1
                        })
                    },
                ),
                TemplateOutcome::Native(Leave),
            ),
            t(
                Pattern::from_codes("EndFinally", &[Ldarg0, Call, Ret]).verify_with(|w| {
                    method_at(w, 1).is_some_and(|m| {
                        m.declaring_type == w.method.declaring_type
                            && m.signature.params.is_empty()
                            && !m.signature.returns_value()
                    })
                }),
                TemplateOutcome::Native(Endfinally),
            ),
            t(
                Pattern::from_codes("EndFilter", &[Ldarg0, Ldarg0, Call, UnboxAny, Call, Ret])
                    .verify_with(|w| is_pop_helper(w, 2) && is_filter_verdict(w, 4)),
                TemplateOutcome::Native(Endfilter),
            ),
            t(
                Pattern::from_codes(
                    "LoadLocal",
                    &[Ldarg0, Ldarg0, Ldfld, Ldarg1, UnboxAny, Callvirt, Call, Ret],
                )
                .verify_with(|w| member_ends_with(w, 5, "::get_Item") && is_push_helper(w, 6)),
                TemplateOutcome::Native(Ldloc),
            ),
            t(
                Pattern::from_codes(
                    "StoreLocal",
                    &[Ldarg0, Ldfld, Ldarg1, UnboxAny, Ldarg0, Call, Callvirt, Ret],
                )
                .verify_with(|w| is_pop_helper(w, 5) && member_ends_with(w, 6, "::set_Item")),
                TemplateOutcome::Native(Stloc),
            ),
            t(
                Pattern::from_codes(
                    "LoadArgument",
                    &[Ldarg0, Ldarg0, Ldfld, Ldarg1, UnboxAny, LdelemRef, Call, Ret],
                )
                .verify_with(|w| is_push_helper(w, 6)),
                TemplateOutcome::Native(Ldarg),
            ),
            t(
                Pattern::from_codes(
                    "StoreArgument",
                    &[Ldarg0, Ldfld, Ldarg1, UnboxAny, Ldarg0, Call, StelemRef, Ret],
                )
                .verify_with(|w| is_pop_helper(w, 5)),
                TemplateOutcome::Native(Starg),
            ),
            t(
                Pattern::from_codes("ResolvedPush", &[Ldarg0, Ldarg1, Call, Call, Ret])
                    .verify_with(|w| is_framework_member(w, 2, PUSH_MEMBERS) && is_push_helper(w, 3)),
                TemplateOutcome::Framework {
                    slot: 2,
                    members: PUSH_MEMBERS,
                },
            ),
            t(
                Pattern::from_codes("ResolvedInvoke", &[Ldarg0, Ldarg1, Call, Callvirt, Ret])
                    .verify_with(|w| {
                        method_at(w, 2).is_some_and(|m| m.declaring_type == w.method.declaring_type)
                            && is_framework_member(w, 3, INVOKE_MEMBERS)
                    }),
                TemplateOutcome::Framework {
                    slot: 3,
                    members: INVOKE_MEMBERS,
                },
            ),
        ];
        TemplateLibrary { templates }
    }
}

impl TemplateLibrary {
    /// Creates the default library.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty library.
    #[must_use]
    pub fn empty() -> Self {
        TemplateLibrary {
            templates: Vec::new(),
        }
    }

    /// Appends a template with the lowest priority.
    #[must_use]
    pub fn with_template(mut self, template: HandlerTemplate) -> Self {
        self.templates.push(template);
        self
    }

    /// Inserts a template ahead of all existing ones.
    #[must_use]
    pub fn with_priority_template(mut self, template: HandlerTemplate) -> Self {
        self.templates.insert(0, template);
        self
    }

    /// Number of templates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// Returns `true` for an empty library.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Templates in priority order.
    pub fn iter(&self) -> impl Iterator<Item = &HandlerTemplate> {
        self.templates.iter()
    }

    /// Classifies `handler` with the first template that matches, returning the template name and
    /// the recovered meaning.
    #[must_use]
    pub fn classify(&self, module: &Module, handler: &MethodDef) -> Option<(&str, OpcodeKind)> {
        self.templates.iter().find_map(|template| {
            template
                .classify(module, handler)
                .map(|kind| (template.name(), kind))
        })
    }
}
