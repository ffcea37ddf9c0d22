pub mod abi;
pub mod config;
pub mod diagnostic;
pub mod directive;
pub mod error;
pub mod ir;
pub mod omp;
pub mod runtime;
pub mod sim;
pub mod span;

use std::rc::Rc;

pub use config::DeviceConfig;
pub use directive::{TranslationUnit, UnitBuilder};
pub use ir::sir::Module;
pub use sim::{launch, KernelArg, LaunchReport, SimConfig, SimError};

use diagnostic::Diagnostic;
use omp::{CodegenSession, DataSharingContext};

/// Lower every target region and device function of `unit` into a
/// finalized device module.
pub fn compile_unit(
    unit: &TranslationUnit,
    cfg: &DeviceConfig,
) -> Result<Module, Vec<Diagnostic>> {
    let mut session = CodegenSession::new(unit, cfg).map_err(|e| vec![e.into()])?;
    session.generate().map_err(|e| vec![e.into()])?;
    session.finalize_module().map_err(|e| vec![e.into()])
}

/// Sharing plans of every context in `unit`, without generating code.
pub fn plan_unit(
    unit: &TranslationUnit,
    cfg: &DeviceConfig,
) -> Result<Vec<Rc<DataSharingContext>>, Vec<Diagnostic>> {
    let mut session = CodegenSession::new(unit, cfg).map_err(|e| vec![e.into()])?;
    session.plan_all().map_err(|e| vec![e.into()])
}

/// Read a directive tree from its JSON form.
pub fn load_unit(text: &str) -> Result<TranslationUnit, Vec<Diagnostic>> {
    TranslationUnit::from_json(text).map_err(|e| {
        vec![Diagnostic::error(
            format!("malformed directive tree: {}", e),
            span::Span::dummy(),
        )
        .with_note(format!("at line {}, column {}", e.line(), e.column()))]
    })
}
