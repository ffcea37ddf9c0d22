//! The generation session.
//!
//! Everything the lowering remembers between constructs lives here and is
//! threaded by `&mut` through generation: the module under construction,
//! memoized sharing plans, wrapper and entry records, the Level0 work each
//! function dispatches and the static level of the code being emitted.

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use tracing::info;

use crate::config::DeviceConfig;
use crate::directive::{Directive, Stmt, TranslationUnit, UnitIndex};
use crate::error::{CodegenError, Result};
use crate::ir::sir::{FnBuilder, Module};
use crate::omp::level::{close_dispatch, next_arm, open_arm, DispatchArm, Regime, StaticLevel};
use crate::omp::sharing::{plan_context, ContextId, DataSharingContext};
use crate::omp::wrapper::WrapperRecord;

/// Label of the join point every lane of a kernel reaches.
pub const EXIT_LABEL: &str = ".omp.exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFunctionRecord {
    pub entry: String,
    pub worker: String,
    pub initializer: String,
    pub exit_label: String,
    /// Number of captures the entry's share helper publishes.
    pub shared_locals: usize,
    /// Worker and initializer have been emitted.
    pub finalized: bool,
}

pub struct CodegenSession<'a> {
    pub(crate) cfg: DeviceConfig,
    pub(crate) index: UnitIndex<'a>,
    pub(crate) module: Module,
    contexts: HashMap<ContextId, Rc<DataSharingContext>>,
    pub(crate) wrappers: BTreeMap<String, WrapperRecord>,
    pub(crate) entries: BTreeMap<String, EntryFunctionRecord>,
    /// Wrappers each function hands to the workers from its Level0 arm.
    pub(crate) level0_work: HashMap<String, Vec<String>>,
    /// Static level of the code currently being emitted.
    pub(crate) level: StaticLevel,
    outlined_counters: HashMap<String, u32>,
}

impl<'a> CodegenSession<'a> {
    pub fn new(unit: &'a TranslationUnit, cfg: &DeviceConfig) -> Result<Self> {
        cfg.validate().map_err(CodegenError::Config)?;
        let index = UnitIndex::build(unit)?;
        let name = unit.source.clone().unwrap_or_else(|| "device".to_string());
        Ok(Self {
            cfg: cfg.clone(),
            index,
            module: Module::new(name),
            contexts: HashMap::new(),
            wrappers: BTreeMap::new(),
            entries: BTreeMap::new(),
            level0_work: HashMap::new(),
            level: StaticLevel::kernel(),
            outlined_counters: HashMap::new(),
        })
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.cfg
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn wrapper(&self, outlined: &str) -> Option<&WrapperRecord> {
        self.wrappers.get(outlined)
    }

    pub fn entry(&self, name: &str) -> Option<&EntryFunctionRecord> {
        self.entries.get(name)
    }

    /// Sharing plan of `id`, computed once.
    pub fn context(&mut self, id: &ContextId) -> Result<Rc<DataSharingContext>> {
        if let Some(ctx) = self.contexts.get(id) {
            return Ok(Rc::clone(ctx));
        }
        let ctx = Rc::new(plan_context(&self.index, id, &self.cfg)?);
        self.contexts.insert(id.clone(), Rc::clone(&ctx));
        Ok(ctx)
    }

    /// Generate every kernel entry and device function of the unit.
    pub fn generate(&mut self) -> Result<()> {
        for (parent, target) in self.index.target_regions() {
            self.gen_kernel_entry(parent, target)?;
        }
        let device: Vec<_> = self.index.device_functions().collect();
        for decl in device {
            self.gen_device_function(decl)?;
        }
        info!(
            module = %self.module.name,
            kernels = self.entries.len(),
            functions = self.module.functions.len(),
            "generated device code"
        );
        Ok(())
    }

    /// Plans of every context in the unit: device functions, target
    /// regions and outlined regions, in a stable order.
    pub fn plan_all(&mut self) -> Result<Vec<Rc<DataSharingContext>>> {
        let mut ids = Vec::new();
        for f in &self.index.unit().functions {
            if f.device {
                ids.push(ContextId::Function(f.name.clone()));
            }
            collect_region_contexts(&f.body, &mut ids);
        }
        ids.sort();
        ids.into_iter().map(|id| self.context(&id)).collect()
    }

    // ── internal helpers ──

    pub(crate) fn next_outlined_name(&mut self, parent: &str, simd: bool) -> String {
        let n = self.outlined_counters.entry(parent.to_string()).or_insert(0);
        let name = if simd {
            format!("{}_omp_outlined_simd_{}", parent, n)
        } else {
            format!("{}_omp_outlined_{}", parent, n)
        };
        *n += 1;
        name
    }

    /// Run `f` with the static level set to `level`, restoring it after.
    pub(crate) fn with_level<T>(
        &mut self,
        level: StaticLevel,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let saved = std::mem::replace(&mut self.level, level);
        let out = f(self);
        self.level = saved;
        out
    }

    /// Emit `arms` as one if-chain; the arm body gets the session back.
    pub(crate) fn emit_arms(
        &mut self,
        fb: &mut FnBuilder,
        arms: &[DispatchArm],
        mut arm_body: impl FnMut(&mut Self, &mut FnBuilder, Regime) -> Result<()>,
    ) -> Result<()> {
        let mut opened = 0;
        for (i, arm) in arms.iter().enumerate() {
            let guarded = open_arm(fb, &self.cfg, arm);
            if guarded {
                opened += 1;
            }
            arm_body(self, fb, arm.regime)?;
            if i + 1 < arms.len() {
                next_arm(fb, guarded);
            }
        }
        close_dispatch(fb, opened);
        Ok(())
    }
}

fn collect_region_contexts(stmt: &Stmt, out: &mut Vec<ContextId>) {
    let mut found: Vec<&Directive> = Vec::new();
    stmt.for_each_directive(&mut |d| found.push(d));
    for d in found {
        if d.kind.is_target() || d.kind.opens_region() {
            out.push(ContextId::Region(d.id));
        }
        collect_region_contexts(&d.body, out);
    }
}
