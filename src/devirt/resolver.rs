//! Resolution of inline operands against the host module.
//!
//! Token operands must already name a row of the module. Position operands describe their target
//! by name and are imported: local definitions are looked up, anything external becomes a new
//! reference. Calls into other virtualized methods are resolved by method key.

use crate::{
    devirt::context::Context,
    metadata::{method::MethodSig, token::Token},
    vm::{
        BindingFlags, FieldData, InlineOperand, MethodData, OperandData, TypeData,
        VirtualMethodEntry,
    },
    Error, Result,
};

impl Context {
    /// Resolves an inline operand to a token of the host module.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TokenNotFound`] for dangling tokens, [`Error::UnresolvedMember`] for local
    /// members that do not exist, or any error of [`Context::resolve_callee`].
    pub fn resolve_operand(&mut self, operand: &InlineOperand) -> Result<Token> {
        match operand {
            InlineOperand::Token(token) => {
                if self.module.contains(*token) {
                    Ok(*token)
                } else {
                    Err(Error::TokenNotFound(*token))
                }
            }
            InlineOperand::Position { data, .. } => self.resolve_data(data),
        }
    }

    fn resolve_data(&mut self, data: &OperandData) -> Result<Token> {
        match data {
            OperandData::Type(ty) => self.resolve_type(ty),
            OperandData::Field(field) => self.resolve_field(field),
            OperandData::Method(method) => self.resolve_method(method),
            OperandData::UserString(value) => Ok(self.module.add_user_string(value)),
            OperandData::EazCall(call) => self.resolve_callee(call.method_key),
        }
    }

    fn resolve_type(&mut self, ty: &TypeData) -> Result<Token> {
        let base = self.module.import_type(&ty.name);
        if ty.generic_args.is_empty() {
            return Ok(base);
        }
        let args = self.resolve_all(&ty.generic_args)?;
        Ok(self.module.import_type_spec(base, args))
    }

    fn resolve_field(&mut self, field: &FieldData) -> Result<Token> {
        let owner = self.resolve_operand(&field.declaring_type)?;
        self.module.import_field(owner, &field.name)
    }

    fn resolve_method(&mut self, method: &MethodData) -> Result<Token> {
        let owner = self.resolve_operand(&method.declaring_type)?;
        let ret = self.resolve_operand(&method.return_type)?;
        let ret = (self.module.type_name(ret).as_deref() != Some("System.Void")).then_some(ret);
        let params = self.resolve_all(&method.parameters)?;

        let signature = if method.binding_flags(&self.layout).contains(BindingFlags::STATIC) {
            MethodSig::new_static(params, ret)
        } else {
            MethodSig::new_instance(params, ret)
        };
        let token = self.module.import_method(owner, &method.name, signature)?;
        if method.generic_args.is_empty() {
            return Ok(token);
        }
        let args = self.resolve_all(&method.generic_args)?;
        Ok(self.module.import_method_spec(token, args))
    }

    fn resolve_all(&mut self, operands: &[InlineOperand]) -> Result<Vec<Token>> {
        operands.iter().map(|op| self.resolve_operand(op)).collect()
    }

    /// Resolves the identity of virtualized method `key`.
    ///
    /// Discovered methods are pre-registered with their call stubs. Any other key is decoded once,
    /// looked up by declaring type, name and parameter types, and memoized. A by-ref parameter
    /// matches only the `&` form of its type, so `M(int)` and `M(ref int)` stay distinct. Only identities are
    /// resolved; the callee's body is never decoded here.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecursiveResolutionCycle`] if `key` is requested while its own identity is
    /// being resolved, a decode error if no entry exists at `key`, or
    /// [`Error::UnresolvedMember`] if the described method is not part of the module.
    pub fn resolve_callee(&mut self, key: u32) -> Result<Token> {
        if let Some(token) = self.known_callee(key) {
            return Ok(token);
        }
        if !self.in_progress.insert(key) {
            return Err(Error::RecursiveResolutionCycle(key));
        }
        let identified = self.identify_callee(key);
        self.in_progress.remove(&key);

        let token = identified?;
        log::debug!("method key {:#x} resolves to {}", key, token);
        self.remember_callee(key, token);
        Ok(token)
    }

    fn identify_callee(&mut self, key: u32) -> Result<Token> {
        let entry =
            VirtualMethodEntry::read_at(self.resolution()?, key, self.bytecode()?, &self.layout)?;
        let record = entry.record;
        let owner = self.resolve_operand(&record.declaring_type)?;
        let params = record
            .parameters
            .iter()
            .map(|p| {
                let ty = self.resolve_operand(&p.param_type)?;
                if p.by_ref {
                    self.module.import_by_ref_type(ty)
                } else {
                    Ok(ty)
                }
            })
            .collect::<Result<Vec<_>>>()?;
        self.module
            .find_method(owner, &record.name, Some(&params))
            .ok_or_else(|| {
                let owner = self.module.type_name(owner).unwrap_or_else(|| owner.to_string());
                Error::UnresolvedMember(format!("{}::{}", owner, record.name))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::{crypt, CipherStream, RollingXor},
        metadata::{method::MethodAttributes, module::Module},
        vm::{EazCallData, LayoutConfig, VirtualMethodRecord, VirtualParameter, VmWriter},
    };

    fn position(data: OperandData) -> InlineOperand {
        InlineOperand::Position {
            position: 0,
            data: Box::new(data),
        }
    }

    fn named_type(name: &str) -> InlineOperand {
        position(OperandData::Type(TypeData {
            name: name.into(),
            generic_args: Vec::new(),
        }))
    }

    #[test]
    fn imports_external_members() {
        let mut ctx = Context::new(Module::new("test"), LayoutConfig::default());
        let layout = ctx.layout.clone();

        let list = position(OperandData::Type(TypeData {
            name: "System.Collections.Generic.List`1".into(),
            generic_args: vec![named_type("System.Int32")],
        }));
        let list = ctx.resolve_operand(&list).unwrap();
        assert_eq!(
            ctx.module.type_name(list).as_deref(),
            Some("System.Collections.Generic.List`1<System.Int32>")
        );

        let write_line = position(OperandData::Method(MethodData {
            declaring_type: named_type("System.Console"),
            flags: layout.binding_flags_byte(BindingFlags::STATIC | BindingFlags::PUBLIC),
            name: "WriteLine".into(),
            return_type: named_type("System.Void"),
            parameters: vec![named_type("System.String")],
            generic_args: Vec::new(),
        }));
        let token = ctx.resolve_operand(&write_line).unwrap();
        assert_eq!(ctx.module.member_name(token).as_deref(), Some("System.Console::WriteLine"));
        let sig = ctx.module.method_sig(token).unwrap();
        assert!(!sig.has_this);
        assert!(!sig.returns_value());
        assert_eq!(ctx.resolve_operand(&write_line).unwrap(), token);

        let hello = ctx
            .resolve_operand(&position(OperandData::UserString("hello".into())))
            .unwrap();
        assert_eq!(ctx.module.user_string(hello), Some("hello"));
    }

    #[test]
    fn dangling_token_and_missing_local_member() {
        let mut module = Module::new("test");
        let local = module.add_type("App", "Local");
        let mut ctx = Context::new(module, LayoutConfig::default());

        assert!(matches!(
            ctx.resolve_operand(&InlineOperand::Token(Token::new(0x0400_0009))),
            Err(Error::TokenNotFound(_))
        ));
        let field = position(OperandData::Field(FieldData {
            declaring_type: InlineOperand::Token(local),
            name: "missing".into(),
            is_static: true,
        }));
        assert!(matches!(ctx.resolve_operand(&field), Err(Error::UnresolvedMember(_))));
    }

    #[test]
    fn callee_memo_and_unknown_key() {
        let mut ctx = Context::new(Module::new("test"), LayoutConfig::default());
        let mut blob = vec![0u8; 16];
        crypt(&RollingXor, &mut blob, 5, 0);
        ctx.resolution = Some(CipherStream::new(blob.clone(), 5));
        ctx.bytecode = Some(CipherStream::new(blob, 5));

        let stub = Token::new(0x0600_0004);
        ctx.remember_callee(0x20, stub);
        let call = position(OperandData::EazCall(EazCallData {
            flags: 0,
            method_key: 0x20,
        }));
        assert_eq!(ctx.resolve_operand(&call).unwrap(), stub);

        assert!(ctx.resolve_callee(0x4000).is_err());
        assert!(ctx.in_progress.is_empty());
    }

    #[test]
    fn in_progress_key_is_a_cycle() {
        let mut ctx = Context::new(Module::new("test"), LayoutConfig::default());
        ctx.in_progress.insert(7);
        assert!(matches!(
            ctx.resolve_callee(7),
            Err(Error::RecursiveResolutionCycle(7))
        ));
    }

    #[test]
    fn by_ref_parameter_picks_its_overload() {
        let mut module = Module::new("test");
        let owner = module.add_type("App", "Counter");
        let int32 = module.import_type("System.Int32");
        let void = module.import_type("System.Void");
        let int32_ref = module.import_type("System.Int32&");
        let statik = MethodAttributes::PUBLIC | MethodAttributes::STATIC;
        let by_value = module.add_method(
            owner,
            "Bump",
            statik,
            MethodSig::new_static(vec![int32], None),
            None,
        );
        let by_ref = module.add_method(
            owner,
            "Bump",
            statik,
            MethodSig::new_static(vec![int32_ref], None),
            None,
        );

        let layout = LayoutConfig::default();
        let mut writer = VmWriter::new();
        let mut keys = Vec::new();
        for is_ref in [true, false] {
            keys.push(writer.pos() as u32);
            let entry = VirtualMethodEntry {
                record: VirtualMethodRecord {
                    declaring_type: InlineOperand::Token(owner),
                    name: "Bump".into(),
                    binding_flags: layout
                        .binding_flags_byte(BindingFlags::PUBLIC | BindingFlags::STATIC),
                    return_type: InlineOperand::Token(void),
                    locals: Vec::new(),
                    parameters: vec![VirtualParameter {
                        param_type: InlineOperand::Token(int32),
                        by_ref: is_ref,
                    }],
                },
                handlers: Vec::new(),
                code_position: 0,
                code_length: 0,
            };
            entry.write(&mut writer, &layout).unwrap();
        }
        let mut resolution = writer.into_inner();
        crypt(&RollingXor, &mut resolution, 9, 0);
        let mut bytecode = vec![0u8; 4];
        crypt(&RollingXor, &mut bytecode, 9, 0);

        let mut ctx = Context::new(module, layout);
        ctx.resolution = Some(CipherStream::new(resolution, 9));
        ctx.bytecode = Some(CipherStream::new(bytecode, 9));
        assert_eq!(ctx.resolve_callee(keys[0]).unwrap(), by_ref);
        assert_eq!(ctx.resolve_callee(keys[1]).unwrap(), by_value);
    }
}
