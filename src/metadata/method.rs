//! Method definitions, signatures and bodies of the host module.

use bitflags::bitflags;

use crate::{
    assembly::{Code, Instruction},
    metadata::{exceptions::ExceptionHandler, token::Token},
};

bitflags! {
    /// Subset of `MethodAttributes` the devirtualizer cares about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MethodAttributes: u16 {
        /// Private accessibility
        const PRIVATE = 0x0001;
        /// Assembly accessibility
        const ASSEMBLY = 0x0003;
        /// Public accessibility
        const PUBLIC = 0x0006;
        /// Defined on the type rather than per instance
        const STATIC = 0x0010;
        /// Virtual dispatch
        const VIRTUAL = 0x0040;
        /// Special name (constructors, accessors)
        const SPECIAL_NAME = 0x0800;
    }
}

/// Method signature with parameter and return types expressed as type tokens.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MethodSig {
    /// Instance method taking `this` as argument zero
    pub has_this: bool,
    /// Parameter types, `this` excluded
    pub params: Vec<Token>,
    /// Return type, `None` for `void`
    pub ret: Option<Token>,
}

impl MethodSig {
    /// Creates a static signature.
    #[must_use]
    pub fn new_static(params: Vec<Token>, ret: Option<Token>) -> Self {
        MethodSig {
            has_this: false,
            params,
            ret,
        }
    }

    /// Creates an instance signature.
    #[must_use]
    pub fn new_instance(params: Vec<Token>, ret: Option<Token>) -> Self {
        MethodSig {
            has_this: true,
            params,
            ret,
        }
    }

    /// Number of stack values a call consumes, `this` included.
    #[must_use]
    pub fn call_pops(&self) -> usize {
        self.params.len() + usize::from(self.has_this)
    }

    /// Returns `true` if the method returns a value.
    #[must_use]
    pub fn returns_value(&self) -> bool {
        self.ret.is_some()
    }
}

/// A native method body.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MethodBody {
    /// Instructions with assigned offsets
    pub instructions: Vec<Instruction>,
    /// Local variable types
    pub locals: Vec<Token>,
    /// Exception handling clauses
    pub exception_handlers: Vec<ExceptionHandler>,
    /// Maximum evaluation stack depth
    pub max_stack: u16,
}

impl MethodBody {
    /// Creates a body from `instructions`, assigning sequential offsets.
    #[must_use]
    pub fn new(mut instructions: Vec<Instruction>) -> Self {
        crate::assembly::assign_offsets(&mut instructions);
        MethodBody {
            instructions,
            locals: Vec::new(),
            exception_handlers: Vec::new(),
            max_stack: 8,
        }
    }

    /// Total encoded size of the instructions.
    #[must_use]
    pub fn code_size(&self) -> u32 {
        self.instructions.iter().map(Instruction::size).sum()
    }

    /// Returns the opcodes of this body, for fingerprinting and diagnostics.
    #[must_use]
    pub fn codes(&self) -> Vec<Code> {
        self.instructions.iter().map(|i| i.code).collect()
    }
}

/// A method definition of the host module.
#[derive(Debug, Clone)]
pub struct MethodDef {
    /// `MethodDef` token
    pub token: Token,
    /// Method name
    pub name: String,
    /// Owning `TypeDef`
    pub declaring_type: Token,
    /// Method attributes
    pub flags: MethodAttributes,
    /// Method signature
    pub signature: MethodSig,
    /// Body, `None` for abstract or runtime-implemented methods
    pub body: Option<MethodBody>,
}

impl MethodDef {
    /// Returns `true` for static methods.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodAttributes::STATIC)
    }

    /// Returns the instructions of the body, or an empty slice.
    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        self.body
            .as_ref()
            .map_or(&[], |body| body.instructions.as_slice())
    }
}
