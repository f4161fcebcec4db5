//! Pipeline orchestrator.
//!
//! [`Devirtualizer::run`] drives one module through the stages in fixed order:
//!
//! 1. **Opcode table** - locate the dispatch initializer, fingerprint the build, select the layout,
//!    classify every handler and open the bytecode stream
//! 2. **Endianness** - optionally recover scrambled byte orders from the host's integer readers
//! 3. **Discovery** - find the call stubs, decode their keys and open the resolution stream
//! 4. **Translation** - translate every method, containing failures per method
//! 5. **Output** - write replacement bodies back according to the save policy
//!
//! Errors of stages 1 and 3 are module-wide and abort the run. A failed endianness stage keeps the
//! configured byte orders. Method failures never abort anything; they only decide, together with
//! [`DevirtConfig::save_anyway`], whether a module is produced at all.
//!
//! # Examples
//!
//! ```rust,no_run
//! use dotdevirt::prelude::*;
//!
//! # fn load() -> Module { Module::new("protected.dll") }
//! let module = load();
//! let output = Devirtualizer::new(DevirtConfig::default().with_save_anyway(true)).run(module);
//! println!("{}", output.result.summary());
//! if let Some(module) = output.module {
//!     // hand the rewritten module to the writer
//!     # drop(module);
//! }
//! ```

use std::sync::Arc;

use strum::IntoEnumIterator;

use crate::{
    crypto::{CipherKind, HexXorCodec, KeyCodec},
    devirt::{
        anchors::{Anchor, AnchorRegistry},
        builder::{build_opcode_table, locate_dispatch},
        context::Context,
        discovery::{discover, open_resource_stream},
        events::EventKind,
        result::{DevirtOutput, DevirtResult, MethodOutcome, Stage, StageStatus},
        templates::TemplateLibrary,
        translator::translate_all,
    },
    emulation::infer_byte_order,
    metadata::{method::MethodBody, module::Module, token::Token},
    vm::{LayoutConfig, LayoutRegistry, ScrambledField},
    Error, Result,
};

/// Orchestrator options.
#[derive(Debug, Clone)]
pub struct DevirtConfig {
    /// Produce a module even if some methods failed; failed stubs keep their original body.
    pub save_anyway: bool,
    /// When a module is produced despite failures, omit failed stubs from it entirely.
    ///
    /// The stub methods are removed from their declaring types. Translated methods that still call
    /// one of them keep a token the saved module no longer defines.
    pub only_save_devirted: bool,
    /// Layout to use instead of the registry's choice.
    pub layout: Option<LayoutConfig>,
    /// Keystream of both VM resources.
    pub cipher: CipherKind,
    /// Method key string codec.
    pub key_codec: Arc<dyn KeyCodec>,
}

impl Default for DevirtConfig {
    fn default() -> Self {
        Self {
            save_anyway: false,
            only_save_devirted: false,
            layout: None,
            cipher: CipherKind::default(),
            key_codec: Arc::new(HexXorCodec),
        }
    }
}

impl DevirtConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets [`DevirtConfig::save_anyway`].
    #[must_use]
    pub fn with_save_anyway(mut self, enabled: bool) -> Self {
        self.save_anyway = enabled;
        self
    }

    /// Sets [`DevirtConfig::only_save_devirted`].
    #[must_use]
    pub fn with_only_save_devirted(mut self, enabled: bool) -> Self {
        self.only_save_devirted = enabled;
        self
    }

    /// Forces `layout` for every module.
    #[must_use]
    pub fn with_layout(mut self, layout: LayoutConfig) -> Self {
        self.layout = Some(layout);
        self
    }

    /// Selects the keystream.
    #[must_use]
    pub fn with_cipher(mut self, cipher: CipherKind) -> Self {
        self.cipher = cipher;
        self
    }

    /// Replaces the method key codec.
    #[must_use]
    pub fn with_key_codec(mut self, codec: Arc<dyn KeyCodec>) -> Self {
        self.key_codec = codec;
        self
    }
}

/// Runs the devirtualization pipeline over modules.
#[derive(Debug, Clone)]
pub struct Devirtualizer {
    config: DevirtConfig,
    anchors: AnchorRegistry,
    templates: TemplateLibrary,
    layouts: LayoutRegistry,
}

impl Default for Devirtualizer {
    fn default() -> Self {
        Self::new(DevirtConfig::default())
    }
}

impl Devirtualizer {
    /// Creates a devirtualizer with the default anchors, templates and an empty layout registry.
    #[must_use]
    pub fn new(config: DevirtConfig) -> Self {
        Devirtualizer {
            config,
            anchors: AnchorRegistry::new(),
            templates: TemplateLibrary::new(),
            layouts: LayoutRegistry::default(),
        }
    }

    /// Replaces the anchor patterns.
    #[must_use]
    pub fn with_anchors(mut self, anchors: AnchorRegistry) -> Self {
        self.anchors = anchors;
        self
    }

    /// Replaces the handler template library.
    #[must_use]
    pub fn with_templates(mut self, templates: TemplateLibrary) -> Self {
        self.templates = templates;
        self
    }

    /// Replaces the layout registry.
    #[must_use]
    pub fn with_layouts(mut self, layouts: LayoutRegistry) -> Self {
        self.layouts = layouts;
        self
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &DevirtConfig {
        &self.config
    }

    /// Devirtualizes `module`.
    ///
    /// Never fails as a whole: a module-wide error is reported in [`DevirtResult::fatal`] and
    /// leaves [`DevirtOutput::module`] empty.
    #[must_use]
    pub fn run(&self, module: Module) -> DevirtOutput {
        let layout = self.config.layout.clone().unwrap_or_default();
        let mut ctx = Context::new(module, layout);
        let mut result = DevirtResult::default();

        let outcome = self.run_stages(&mut ctx, &mut result);

        result.methods = ctx.methods.iter().map(MethodOutcome::from).collect();
        result.fingerprint = ctx.fingerprint.clone();
        for stage in Stage::iter() {
            if !result.stages.iter().any(|(s, _)| *s == stage) {
                result.set_stage(stage, StageStatus::Skipped);
            }
        }

        let module = match outcome {
            Ok(save) => save.then(|| std::mem::take(&mut ctx.module)),
            Err(e) => {
                log::warn!("devirtualization aborted: {}", e);
                result.fatal = Some(e);
                None
            }
        };
        result.events = std::mem::take(&mut ctx.events);
        log::info!(
            "devirtualized {}/{} methods",
            result.translated_count(),
            result.methods.len()
        );
        DevirtOutput { module, result }
    }

    /// Runs all stages; returns whether the module should be saved.
    fn run_stages(&self, ctx: &mut Context, result: &mut DevirtResult) -> Result<bool> {
        self.stage(ctx, result, Stage::OpcodeTable, Self::opcode_table)?;

        if ctx.layout.infer_endianness {
            // keeps the configured orders on failure
            let _ = self.stage(ctx, result, Stage::Endianness, Self::endianness);
        } else {
            result.set_stage(Stage::Endianness, StageStatus::Skipped);
        }

        self.stage(ctx, result, Stage::Discovery, Self::discovery)?;
        self.stage(ctx, result, Stage::Translation, |_, ctx| {
            translate_all(ctx);
            Ok(())
        })?;

        let failed = ctx.methods.iter().filter(|m| !m.successfully_translated).count();
        if failed > 0 && !self.config.save_anyway {
            log::warn!("{} methods failed, not saving the module", failed);
            ctx.events.warn(format!("{failed} methods failed, module not saved"));
            result.set_stage(Stage::Output, StageStatus::Skipped);
            return Ok(false);
        }
        self.stage(ctx, result, Stage::Output, Self::output)?;
        Ok(true)
    }

    fn stage(
        &self,
        ctx: &mut Context,
        result: &mut DevirtResult,
        stage: Stage,
        run: impl FnOnce(&Self, &mut Context) -> Result<()>,
    ) -> Result<()> {
        log::info!("stage {} started", stage.name());
        ctx.events.record(EventKind::StageStarted).stage(stage.name());
        match run(self, ctx) {
            Ok(()) => {
                ctx.events.record(EventKind::StageCompleted).stage(stage.name());
                result.set_stage(stage, StageStatus::Completed);
                Ok(())
            }
            Err(e) => {
                log::warn!("stage {} failed: {}", stage.name(), e);
                ctx.events
                    .record(EventKind::StageFailed)
                    .stage(stage.name())
                    .message(e.to_string());
                result.set_stage(stage, StageStatus::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    fn opcode_table(&self, ctx: &mut Context) -> Result<()> {
        let dispatch = locate_dispatch(&ctx.module, &self.anchors, &ctx.events)?;
        let fingerprint = dispatch.fingerprint(&ctx.module)?;

        let layout = match &self.config.layout {
            Some(layout) => layout.clone(),
            None => self.layouts.select(&fingerprint).clone(),
        };
        layout.validate()?;
        let known = self.config.layout.is_none() && self.layouts.is_known(&fingerprint);
        log::info!(
            "build {} ({})",
            fingerprint,
            if known { "known layout" } else { "default layout" }
        );
        ctx.events
            .record(EventKind::LayoutSelected)
            .stage(Stage::OpcodeTable.name())
            .message(format!("{fingerprint} known={known}"));
        ctx.layout = layout;

        ctx.opcodes = build_opcode_table(&ctx.module, &dispatch, &self.templates, &ctx.events);
        log::info!(
            "{} opcodes classified, {} unknown",
            ctx.opcodes.len(),
            ctx.opcodes.unknown().count()
        );
        ctx.bytecode = Some(open_resource_stream(
            &ctx.module,
            &self.anchors,
            dispatch.dispatch_type,
            self.config.cipher.transform(),
        )?);
        ctx.fingerprint = Some(fingerprint);
        ctx.dispatch = Some(dispatch);
        Ok(())
    }

    fn endianness(&self, ctx: &mut Context) -> Result<()> {
        let pattern = self.anchors.get(Anchor::ScrambledIntReader);
        let readers = pattern.matching_methods(&ctx.module);
        if readers.is_empty() {
            return Err(Error::PatternNotFound(pattern.name().to_string()));
        }

        let mut inferred = Vec::new();
        for reader in readers {
            let Some(field) = scrambled_field(&ctx.module, reader) else {
                continue;
            };
            if inferred.iter().any(|(known, _)| *known == field) {
                continue;
            }
            let order = infer_byte_order(&ctx.module, reader, usize::from(field.width()))?;
            ctx.events
                .record(EventKind::ByteOrderInferred)
                .method(reader)
                .stage(Stage::Endianness.name())
                .message(format!("{field:?} {:?}", order.permutation()));
            inferred.push((field, order));
        }

        for (field, order) in inferred {
            ctx.layout = std::mem::take(&mut ctx.layout).with_byte_order(field, order);
        }
        Ok(())
    }

    fn discovery(&self, ctx: &mut Context) -> Result<()> {
        let found = discover(
            &ctx.module,
            &self.anchors,
            self.config.key_codec.as_ref(),
            self.config.cipher.transform(),
            &ctx.events,
        )?;
        for method in found.methods.iter().filter(|m| !m.is_failed()) {
            ctx.remember_callee(method.key, method.stub);
        }
        ctx.entry = Some(found.entry);
        ctx.crypto_key = Some(found.crypto_key);
        ctx.resolution = Some(found.resolution);
        ctx.methods = found.methods;
        Ok(())
    }

    fn output(&self, ctx: &mut Context) -> Result<()> {
        for method in &ctx.methods {
            if method.successfully_translated {
                let mut body = MethodBody::new(method.instructions.clone());
                body.locals.clone_from(&method.locals);
                body.exception_handlers.clone_from(&method.exception_handlers);
                ctx.module.replace_body(method.stub, body)?;
                ctx.events
                    .record(EventKind::BodyReplaced)
                    .method(method.stub)
                    .stage(Stage::Output.name());
            } else if self.config.only_save_devirted {
                ctx.module.omit_method(method.stub)?;
            }
        }
        Ok(())
    }
}

/// The scrambled integer a reader method produces, judged by its return type.
fn scrambled_field(module: &Module, reader: Token) -> Option<ScrambledField> {
    let ret = module.method(reader)?.signature.ret?;
    match module.type_name(ret)?.as_str() {
        "System.UInt16" => Some(ScrambledField::Opcode),
        "System.Int32" | "System.UInt32" => Some(ScrambledField::Int32),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::Code,
        file::io::ByteOrder,
        test::{HandlerShape as H, VInstr, VirtualMethodSpec, VmModuleBuilder},
        vm::{BuildFingerprint, VmOperand},
    };

    fn sample() -> VmModuleBuilder {
        VmModuleBuilder::new()
            .with_method(
                VirtualMethodSpec::new("Twice", &["System.Int32"], Some("System.Int32")).code(vec![
                    VInstr::op(H::Ldarg, VmOperand::Argument(0)),
                    VInstr::op(H::LdcI4, VmOperand::Int32(0x0102_0304)),
                    VInstr::op(H::Add, VmOperand::None),
                    VInstr::op(H::Dup, VmOperand::None),
                    VInstr::op(H::Add, VmOperand::None),
                    VInstr::op(H::Ret, VmOperand::None),
                ]),
            )
            .with_method(
                VirtualMethodSpec::new("Forward", &["System.Int32"], Some("System.Int32")).code(vec![
                    VInstr::op(H::Ldarg, VmOperand::Argument(0)),
                    VInstr::call(0),
                    VInstr::op(H::Ret, VmOperand::None),
                ]),
            )
    }

    fn with_unknown_user(builder: VmModuleBuilder) -> VmModuleBuilder {
        builder.with_handler(H::Unrecognised, 0x0777).with_method(
            VirtualMethodSpec::new("Broken", &[], None).code(vec![
                VInstr::raw(0x0777, VmOperand::None),
                VInstr::op(H::Ret, VmOperand::None),
            ]),
        )
    }

    #[test]
    fn full_run_replaces_stub_bodies() {
        let vm = sample().build();
        let output = Devirtualizer::default().run(vm.module.clone());

        let result = &output.result;
        assert!(result.is_success(), "{}", result.summary());
        assert_eq!(result.translated_count(), 2);
        assert_eq!(result.stage(Stage::Endianness), &StageStatus::Skipped);
        assert_eq!(result.stage(Stage::Output), &StageStatus::Completed);
        assert!(result.fingerprint.is_some());
        assert_eq!(result.events.count_kind(EventKind::BodyReplaced), 2);

        let module = output.module.unwrap();
        let twice = module.method(vm.stub_named("Twice").unwrap()).unwrap();
        assert_eq!(
            twice.body.as_ref().unwrap().codes(),
            vec![Code::Ldarg, Code::LdcI4, Code::Add, Code::Dup, Code::Add, Code::Ret]
        );
        assert_eq!(twice.instructions()[1].ldc_value(), Some(0x0102_0304));
        let forward = module.method(vm.stub_named("Forward").unwrap()).unwrap();
        assert_eq!(forward.instructions()[1].token(), vm.stub_named("Twice"));
    }

    #[test]
    fn failed_method_blocks_saving_by_default() {
        let vm = with_unknown_user(sample()).build();
        let output = Devirtualizer::default().run(vm.module.clone());

        assert!(output.module.is_none());
        assert!(output.result.fatal.is_none());
        assert_eq!(output.result.failed_count(), 1);
        assert_eq!(output.result.translated_count(), 2);
        assert_eq!(output.result.stage(Stage::Output), &StageStatus::Skipped);
    }

    #[test]
    fn save_policies() {
        let vm = with_unknown_user(sample()).build();
        let broken = vm.stub_named("Broken").unwrap();

        let keep = Devirtualizer::new(DevirtConfig::new().with_save_anyway(true)).run(vm.module.clone());
        let module = keep.module.unwrap();
        assert_eq!(
            module.method(broken).unwrap().body,
            vm.module.method(broken).unwrap().body
        );

        let strip = Devirtualizer::new(
            DevirtConfig::new()
                .with_save_anyway(true)
                .with_only_save_devirted(true),
        )
        .run(vm.module.clone());
        let module = strip.module.unwrap();
        assert!(module.method(broken).is_none());
        assert!(module.methods().all(|m| m.token != broken));
        let twice = vm.stub_named("Twice").unwrap();
        assert!(module.method(twice).unwrap().body.is_some());
        let owner = module.method(twice).unwrap().declaring_type;
        assert!(!module.type_def(owner).unwrap().methods.contains(&broken));
    }

    #[test]
    fn module_without_vm_is_fatal() {
        let output = Devirtualizer::default().run(Module::new("plain.dll"));
        assert!(matches!(output.result.fatal, Some(Error::PatternNotFound(_))));
        assert!(output.module.is_none());
        assert!(matches!(
            output.result.stage(Stage::OpcodeTable),
            StageStatus::Failed(_)
        ));
        assert_eq!(output.result.stage(Stage::Discovery), &StageStatus::Skipped);
        assert!(output.result.events.has(EventKind::StageFailed));
    }

    #[test]
    fn scrambled_build_needs_its_layout() {
        let scrambled = LayoutConfig::default()
            .with_byte_order(ScrambledField::Opcode, ByteOrder::big(2))
            .with_byte_order(
                ScrambledField::Int32,
                ByteOrder::from_permutation(&[2, 0, 3, 1]).unwrap(),
            );
        let vm = sample().with_layout(scrambled.clone()).with_scrambled_readers().build();

        let plain = Devirtualizer::default().run(vm.module.clone());
        assert_eq!(plain.result.translated_count(), 0);

        let inferred = Devirtualizer::new(
            DevirtConfig::new().with_layout(LayoutConfig::default().with_endianness_inference(true)),
        )
        .run(vm.module.clone());
        assert!(inferred.result.is_success(), "{}", inferred.result.summary());
        assert_eq!(inferred.result.stage(Stage::Endianness), &StageStatus::Completed);
        assert_eq!(inferred.result.events.count_kind(EventKind::ByteOrderInferred), 2);

        let fingerprint = plain.result.fingerprint.clone().unwrap();
        let mut layouts = LayoutRegistry::default();
        layouts.register(fingerprint, scrambled).unwrap();
        let registered = Devirtualizer::default().with_layouts(layouts).run(vm.module.clone());
        assert!(registered.result.is_success(), "{}", registered.result.summary());
    }

    #[test]
    fn failed_inference_keeps_configured_layout() {
        let vm = sample().build();
        let output = Devirtualizer::new(
            DevirtConfig::new().with_layout(LayoutConfig::default().with_endianness_inference(true)),
        )
        .run(vm.module.clone());
        assert!(matches!(
            output.result.stage(Stage::Endianness),
            StageStatus::Failed(_)
        ));
        assert!(output.result.is_success());
    }

    #[test]
    fn layout_error_during_inference_is_not_fatal() {
        let mut vm = sample().with_scrambled_readers().build();
        let reader_type = vm.module.find_type("VmBinaryReader").unwrap();
        let read_opcode = vm.module.find_method(reader_type, "ReadOpcode", None).unwrap();
        let read_int32 = vm.module.find_method(reader_type, "ReadInt32", None).unwrap();
        let two_bytes = vm.module.method(read_opcode).unwrap().body.clone().unwrap();
        vm.module.replace_body(read_int32, two_bytes).unwrap();

        let output = Devirtualizer::new(
            DevirtConfig::new().with_layout(LayoutConfig::default().with_endianness_inference(true)),
        )
        .run(vm.module);
        match output.result.stage(Stage::Endianness) {
            StageStatus::Failed(reason) => assert!(reason.contains("Invalid layout"), "{reason}"),
            other => panic!("endianness stage ended {other:?}"),
        }
        assert!(output.result.fatal.is_none());
        assert!(output.result.is_success(), "{}", output.result.summary());
        assert_eq!(output.result.translated_count(), 2);
    }

    #[test]
    fn fingerprint_tracks_dispatch_shape() {
        let a = Devirtualizer::default().run(sample().build().module);
        let b = Devirtualizer::default().run(
            sample()
                .with_handler(H::Xor, 0x0BAD)
                .build()
                .module,
        );
        let fa: Option<BuildFingerprint> = a.result.fingerprint;
        assert!(fa.is_some());
        assert_ne!(fa, b.result.fingerprint);
    }
}
