//! Per-run state shared by the pipeline stages.

use std::collections::{HashMap, HashSet};

use crate::{
    crypto::CipherStream,
    devirt::{
        builder::DispatchTable, events::EventLog, method::VirtualizedMethod, opcodes::OpcodeTable,
    },
    metadata::{module::Module, token::Token},
    vm::{BuildFingerprint, LayoutConfig},
    Error, Result,
};

/// State of one devirtualization run over one module.
///
/// Stages fill the context strictly in pipeline order: the opcode table stage sets the dispatch
/// table, fingerprint, layout, opcode table and bytecode stream, discovery adds the entry method,
/// crypto key, resolution stream and methods. The translator only reads what earlier stages
/// produced, apart from importing references into the module and memoizing callee identities.
#[derive(Debug)]
pub struct Context {
    /// The module being devirtualized
    pub module: Module,
    /// Effective layout of this build
    pub layout: LayoutConfig,
    /// Build fingerprint of the dispatch initializer
    pub fingerprint: Option<BuildFingerprint>,
    /// Handler registrations
    pub dispatch: Option<DispatchTable>,
    /// Recovered opcode meanings
    pub opcodes: OpcodeTable,
    /// Virtual code and operand data
    pub bytecode: Option<CipherStream>,
    /// Method entries indexed by method key
    pub resolution: Option<CipherStream>,
    /// Dispatcher entry method called by every stub
    pub entry: Option<Token>,
    /// Constant mixed into every method key
    pub crypto_key: Option<i64>,
    /// Discovered methods
    pub methods: Vec<VirtualizedMethod>,
    /// Method key to the token standing for that method
    pub(crate) callee_memo: HashMap<u32, Token>,
    /// Method keys whose identity is being resolved
    pub(crate) in_progress: HashSet<u32>,
    /// Structured record of the run
    pub events: EventLog,
}

impl Context {
    /// Creates an empty context over `module`.
    #[must_use]
    pub fn new(module: Module, layout: LayoutConfig) -> Self {
        Context {
            module,
            layout,
            fingerprint: None,
            dispatch: None,
            opcodes: OpcodeTable::new(),
            bytecode: None,
            resolution: None,
            entry: None,
            crypto_key: None,
            methods: Vec::new(),
            callee_memo: HashMap::new(),
            in_progress: HashSet::new(),
            events: EventLog::new(),
        }
    }

    /// The bytecode stream.
    ///
    /// # Errors
    ///
    /// Fails if the opcode table stage has not opened it.
    pub fn bytecode(&self) -> Result<&CipherStream> {
        self.bytecode
            .as_ref()
            .ok_or_else(|| Error::Error("bytecode stream is not open".into()))
    }

    /// The resolution stream.
    ///
    /// # Errors
    ///
    /// Fails if discovery has not opened it.
    pub fn resolution(&self) -> Result<&CipherStream> {
        self.resolution
            .as_ref()
            .ok_or_else(|| Error::Error("resolution stream is not open".into()))
    }

    /// Records that method `key` is represented by `token`, typically its call stub.
    pub fn remember_callee(&mut self, key: u32, token: Token) {
        self.callee_memo.insert(key, token);
    }

    /// Token already known for method `key`.
    #[must_use]
    pub fn known_callee(&self, key: u32) -> Option<Token> {
        self.callee_memo.get(&key).copied()
    }
}
