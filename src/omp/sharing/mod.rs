//! Data sharing planner.
//!
//! For every context (kernel entry, outlined region or device function)
//! that textually contains parallel or simd constructs, collect the
//! variables those constructs capture, decide once how each one is
//! shared, and lay out the records the slot allocator hands out.

pub mod infra;
pub mod layout;

use std::fmt;

use tracing::debug;

use crate::config::DeviceConfig;
use crate::directive::{
    CaptureKind, CaptureTarget, Directive, DirectiveId, Stmt, Storage, Ty, UnitIndex, VarId,
};
use crate::error::{CodegenError, Result};
use crate::span::Span;

pub use layout::{FieldLayout, RecordLayout};

/// An enclosing declaration that can own a data-sharing context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContextId {
    /// A device function.
    Function(String),
    /// A target region (kernel entry) or an outlined parallel/simd region.
    Region(DirectiveId),
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextId::Function(name) => write!(f, "fn {}", name),
            ContextId::Region(id) => write!(f, "region {}", id),
        }
    }
}

/// How a variable's storage is realized inside a given context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// Owns a local slot.
    Local,
    /// Holds the address of storage living elsewhere.
    Reference,
    /// Typed view over local storage of another type.
    View,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SharingMode {
    /// Share the variable's own address; the variable moves into the record.
    ByValueAddress,
    /// Share the pointer to storage that already lives elsewhere.
    ByReference,
    /// Copy the pointee into the record and share a typed pointer to it.
    ByPointerCast,
}

impl SharingMode {
    pub fn from_binding(binding: Binding) -> Self {
        match binding {
            Binding::Local => SharingMode::ByValueAddress,
            Binding::Reference => SharingMode::ByReference,
            Binding::View => SharingMode::ByPointerCast,
        }
    }

    /// Whether the share helper publishes a new address for the variable.
    pub fn rebinds(self) -> bool {
        self != SharingMode::ByReference
    }
}

impl fmt::Display for SharingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SharingMode::ByValueAddress => "by-value-address",
            SharingMode::ByReference => "by-reference",
            SharingMode::ByPointerCast => "by-pointer-cast",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureDescriptor {
    pub identity: CaptureTarget,
    pub mode: SharingMode,
    pub name: String,
    /// Type stored in the record for value-like modes.
    pub ty: Ty,
    pub ty_size: u32,
    pub ty_align: u32,
}

/// The master and worker-warp records of a context with captures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedRecords {
    pub master: RecordLayout,
    pub worker: RecordLayout,
}

impl SharedRecords {
    /// Lay out both records for `captures`, or `None` when there are none.
    pub fn plan(base: &str, captures: &[CaptureDescriptor], cfg: &DeviceConfig) -> Option<Self> {
        if captures.is_empty() {
            return None;
        }
        Some(Self {
            master: RecordLayout::master(
                format!("{}.master_record", base),
                captures,
                cfg.pointer_width,
            ),
            worker: RecordLayout::worker(
                format!("{}.warp_record", base),
                captures,
                cfg.warp_size,
                cfg.pointer_width,
            ),
        })
    }
}

/// Planner output for one context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSharingContext {
    pub id: ContextId,
    pub captures: Vec<CaptureDescriptor>,
    pub records: Option<SharedRecords>,
}

impl DataSharingContext {
    pub fn is_empty(&self) -> bool {
        self.captures.is_empty()
    }

    pub fn index_of(&self, identity: CaptureTarget) -> Option<usize> {
        self.captures.iter().position(|c| c.identity == identity)
    }

    /// Master and worker field of capture `index`.
    pub fn fields(&self, index: usize) -> Option<(&FieldLayout, &FieldLayout)> {
        let records = self.records.as_ref()?;
        Some((
            records.master.fields.get(index)?,
            records.worker.fields.get(index)?,
        ))
    }

    pub fn master_size(&self) -> u32 {
        self.records.as_ref().map_or(0, |r| r.master.size)
    }

    pub fn worker_size(&self) -> u32 {
        self.records.as_ref().map_or(0, |r| r.worker.size)
    }
}

impl fmt::Display for DataSharingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "context {}", self.id)?;
        for cap in &self.captures {
            writeln!(f, "  capture {}: {}", cap.name, cap.mode)?;
        }
        if let Some(records) = &self.records {
            writeln!(f, "  master {}", records.master)?;
            writeln!(f, "  worker {}", records.worker)?;
        }
        Ok(())
    }
}

// ─── Storage bindings ─────────────────────────────────────────────

/// Storage binding of `var` inside `ctx`.
///
/// Variables captured by the context's own region arrive as addresses,
/// except by-copy captures of a target region which arrive as values and
/// are spilled to a local slot.
pub fn binding_of(index: &UnitIndex<'_>, ctx: &ContextId, var: VarId) -> Result<Binding> {
    if let ContextId::Region(id) = ctx {
        if let Some(info) = index.directive(*id) {
            let d = info.directive;
            let own = d
                .captures
                .iter()
                .find(|c| c.target == CaptureTarget::Var(var));
            if let Some(cap) = own {
                let by_value = d.kind.is_target() && cap.kind == CaptureKind::ByCopy;
                return Ok(if by_value {
                    Binding::Local
                } else {
                    Binding::Reference
                });
            }
        }
    }
    let decl = index.var(var, Span::dummy())?;
    Ok(match decl.storage {
        Storage::Local => Binding::Local,
        Storage::Reference => Binding::Reference,
        Storage::View { .. } => Binding::View,
    })
}

/// Whether `ctx` has an object pointer available.
fn context_has_this(index: &UnitIndex<'_>, ctx: &ContextId) -> bool {
    match ctx {
        ContextId::Function(name) => index.function(name).is_some_and(|f| f.has_this),
        ContextId::Region(id) => index.directive(*id).is_some_and(|info| {
            info.directive
                .captures
                .iter()
                .any(|c| c.target == CaptureTarget::This)
        }),
    }
}

/// Body a context's planner walks.
pub fn context_body<'a>(index: &UnitIndex<'a>, ctx: &ContextId) -> Option<&'a Stmt> {
    match ctx {
        ContextId::Function(name) => index.function(name).map(|f| &f.body),
        ContextId::Region(id) => index.directive(*id).map(|info| &info.directive.body),
    }
}

// ─── Planner ──────────────────────────────────────────────────────

/// Regions whose captures the context must share: parallel/simd
/// constructs reached without entering another region's body.
pub fn shared_regions<'a>(body: &'a Stmt) -> Vec<&'a Directive> {
    let mut out = Vec::new();
    collect_regions(body, &mut out);
    out
}

fn collect_regions<'a>(stmt: &'a Stmt, out: &mut Vec<&'a Directive>) {
    let mut found = Vec::new();
    stmt.for_each_directive(&mut |d| found.push(d));
    for d in found {
        if d.kind.opens_region() {
            out.push(d);
        } else {
            collect_regions(&d.body, out);
        }
    }
}

pub fn plan_context(
    index: &UnitIndex<'_>,
    ctx: &ContextId,
    cfg: &DeviceConfig,
) -> Result<DataSharingContext> {
    let mut captures: Vec<CaptureDescriptor> = Vec::new();

    if let Some(body) = context_body(index, ctx) {
        for region in shared_regions(body) {
            for cap in &region.captures {
                if captures.iter().any(|c| c.identity == cap.target) {
                    continue;
                }
                captures.push(describe_capture(index, ctx, region, cap.target, cap.kind)?);
            }
        }
    }

    let base = match ctx {
        ContextId::Function(name) => name.clone(),
        ContextId::Region(id) => format!("region{}", id.0),
    };
    let records = SharedRecords::plan(&base, &captures, cfg);
    let planned = DataSharingContext {
        id: ctx.clone(),
        captures,
        records,
    };
    debug!(
        context = %ctx,
        captures = planned.captures.len(),
        master_size = planned.master_size(),
        worker_size = planned.worker_size(),
        "planned data sharing"
    );
    Ok(planned)
}

fn describe_capture(
    index: &UnitIndex<'_>,
    ctx: &ContextId,
    region: &Directive,
    target: CaptureTarget,
    kind: CaptureKind,
) -> Result<CaptureDescriptor> {
    let var = match target {
        CaptureTarget::This => {
            if !context_has_this(index, ctx) {
                return Err(CodegenError::MissingThis {
                    function: ctx.to_string(),
                    span: region.span,
                });
            }
            return Ok(CaptureDescriptor {
                identity: target,
                mode: SharingMode::ByReference,
                name: "this".to_string(),
                ty: Ty::I8,
                ty_size: 1,
                ty_align: 1,
            });
        }
        CaptureTarget::Var(v) => v,
    };
    let decl = index.var(var, region.span)?;
    let region_name = region.kind.name().to_string();

    if kind == CaptureKind::Vla || decl.ty.is_vla() {
        return Err(CodegenError::VlaCapture {
            name: decl.name.clone(),
            region: region_name,
            span: region.span,
        });
    }
    if kind == CaptureKind::ByCopy {
        return Err(CodegenError::ByCopyCapture {
            name: decl.name.clone(),
            region: region_name,
            span: region.span,
        });
    }

    let mode = SharingMode::from_binding(binding_of(index, ctx, var)?);
    if mode == SharingMode::ByPointerCast && !decl.ty.is_scalar() {
        return Err(CodegenError::AggregateView {
            name: decl.name.clone(),
            span: region.span,
        });
    }
    // is_vla was rejected above, so the type has a size
    let (ty_size, ty_align) = match (decl.ty.size(), decl.ty.align()) {
        (Some(s), Some(a)) => (s, a),
        _ => {
            return Err(CodegenError::VlaCapture {
                name: decl.name.clone(),
                region: region.kind.name().to_string(),
                span: region.span,
            })
        }
    };
    Ok(CaptureDescriptor {
        identity: target,
        mode,
        name: decl.name.clone(),
        ty: decl.ty.clone(),
        ty_size,
        ty_align,
    })
}

#[cfg(test)]
mod tests;
