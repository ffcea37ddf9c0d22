//! The device runtime ABI the generated protocol calls into.
//!
//! Symbol names and arities are fixed by the device runtime library; the
//! code generator only ever references them through `RuntimeFn`.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RuntimeFn {
    KernelInit,
    KernelDeinit,
    SerializedParallel,
    EndSerializedParallel,
    KernelPrepareParallel,
    KernelParallel,
    KernelEndParallel,
    KernelConvergentParallel,
    KernelEndConvergentParallel,
    KernelConvergentSimd,
    KernelEndConvergentSimd,
    WarpActiveThreadMask,
    InitializeDataSharingEnvironment,
    DataSharingEnvironmentBegin,
    DataSharingEnvironmentEnd,
    GetDataSharingEnvironmentFrame,
}

impl RuntimeFn {
    pub const ALL: [RuntimeFn; 16] = [
        RuntimeFn::KernelInit,
        RuntimeFn::KernelDeinit,
        RuntimeFn::SerializedParallel,
        RuntimeFn::EndSerializedParallel,
        RuntimeFn::KernelPrepareParallel,
        RuntimeFn::KernelParallel,
        RuntimeFn::KernelEndParallel,
        RuntimeFn::KernelConvergentParallel,
        RuntimeFn::KernelEndConvergentParallel,
        RuntimeFn::KernelConvergentSimd,
        RuntimeFn::KernelEndConvergentSimd,
        RuntimeFn::WarpActiveThreadMask,
        RuntimeFn::InitializeDataSharingEnvironment,
        RuntimeFn::DataSharingEnvironmentBegin,
        RuntimeFn::DataSharingEnvironmentEnd,
        RuntimeFn::GetDataSharingEnvironmentFrame,
    ];

    pub fn symbol(self) -> &'static str {
        match self {
            RuntimeFn::KernelInit => "__kmpc_kernel_init",
            RuntimeFn::KernelDeinit => "__kmpc_kernel_deinit",
            RuntimeFn::SerializedParallel => "__kmpc_serialized_parallel",
            RuntimeFn::EndSerializedParallel => "__kmpc_end_serialized_parallel",
            RuntimeFn::KernelPrepareParallel => "__kmpc_kernel_prepare_parallel",
            RuntimeFn::KernelParallel => "__kmpc_kernel_parallel",
            RuntimeFn::KernelEndParallel => "__kmpc_kernel_end_parallel",
            RuntimeFn::KernelConvergentParallel => "__kmpc_kernel_convergent_parallel",
            RuntimeFn::KernelEndConvergentParallel => "__kmpc_kernel_end_convergent_parallel",
            RuntimeFn::KernelConvergentSimd => "__kmpc_kernel_convergent_simd",
            RuntimeFn::KernelEndConvergentSimd => "__kmpc_kernel_end_convergent_simd",
            RuntimeFn::WarpActiveThreadMask => "__kmpc_warp_active_thread_mask",
            RuntimeFn::InitializeDataSharingEnvironment => {
                "__kmpc_initialize_data_sharing_environment"
            }
            RuntimeFn::DataSharingEnvironmentBegin => "__kmpc_data_sharing_environment_begin",
            RuntimeFn::DataSharingEnvironmentEnd => "__kmpc_data_sharing_environment_end",
            RuntimeFn::GetDataSharingEnvironmentFrame => {
                "__kmpc_get_data_sharing_environment_frame"
            }
        }
    }

    /// Number of arguments the runtime entry point takes.
    pub fn arity(self) -> usize {
        match self {
            RuntimeFn::KernelDeinit
            | RuntimeFn::KernelEndParallel
            | RuntimeFn::WarpActiveThreadMask => 0,
            RuntimeFn::KernelPrepareParallel
            | RuntimeFn::KernelParallel
            | RuntimeFn::KernelEndConvergentParallel
            | RuntimeFn::KernelEndConvergentSimd
            | RuntimeFn::GetDataSharingEnvironmentFrame => 1,
            RuntimeFn::KernelInit
            | RuntimeFn::SerializedParallel
            | RuntimeFn::EndSerializedParallel
            | RuntimeFn::InitializeDataSharingEnvironment => 2,
            RuntimeFn::KernelConvergentParallel => 3,
            RuntimeFn::DataSharingEnvironmentEnd => 5,
            RuntimeFn::KernelConvergentSimd => 5,
            RuntimeFn::DataSharingEnvironmentBegin => 6,
        }
    }

    /// Whether the call produces a value.
    pub fn has_result(self) -> bool {
        matches!(
            self,
            RuntimeFn::KernelParallel
                | RuntimeFn::KernelConvergentParallel
                | RuntimeFn::KernelConvergentSimd
                | RuntimeFn::WarpActiveThreadMask
                | RuntimeFn::DataSharingEnvironmentBegin
                | RuntimeFn::GetDataSharingEnvironmentFrame
        )
    }

    /// Warp-collective entry points must be reached by every active lane
    /// of the calling group at the same time.
    pub fn is_collective(self) -> bool {
        matches!(
            self,
            RuntimeFn::KernelConvergentParallel
                | RuntimeFn::KernelEndConvergentParallel
                | RuntimeFn::KernelConvergentSimd
                | RuntimeFn::KernelEndConvergentSimd
                | RuntimeFn::WarpActiveThreadMask
                | RuntimeFn::DataSharingEnvironmentBegin
                | RuntimeFn::DataSharingEnvironmentEnd
        )
    }

    pub fn from_symbol(symbol: &str) -> Option<RuntimeFn> {
        RuntimeFn::ALL.into_iter().find(|f| f.symbol() == symbol)
    }
}

impl fmt::Display for RuntimeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}
