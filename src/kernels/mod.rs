//! Kernel selection and binding.
//!
//! A [`KernelProvider`] turns a validated configuration into an opaque kernel
//! whose only operation is `run` over the tensors bound at configuration time.

pub mod avx;
pub mod optimized;
pub mod reference;
pub mod utils;

use crate::config::{EngineConfig, ProviderKind};
use crate::error::{OpError, Result};
use crate::fusion::ConvConf;
use crate::ops::concat::ConcatConf;
use crate::tensor::{DataType, Element, Tensor};
use log::{debug, error, info, warn};
use std::sync::{Arc, OnceLock};

pub use optimized::OptimizedProvider;
pub use reference::ReferenceProvider;

/// Tensors a conv kernel reads and writes.
pub struct ConvIo<'a> {
    pub src: &'a Tensor,
    pub weights: &'a Tensor,
    pub bias: Option<&'a Tensor>,
    pub weights_1x1: Option<&'a Tensor>,
    pub bias_1x1: Option<&'a Tensor>,
    pub dst: &'a mut Tensor,
}

pub struct ConcatIo<'a> {
    pub srcs: Vec<&'a Tensor>,
    pub dst: &'a mut Tensor,
}

pub trait ConvKernel: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, io: &mut ConvIo<'_>);
}

pub trait ConcatKernel: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, io: &mut ConcatIo<'_>);
}

pub trait KernelProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn is_available(&self) -> bool;
    fn bind_conv(&self, conf: &ConvConf) -> Result<Box<dyn ConvKernel>>;
    fn bind_concat(&self, conf: &ConcatConf) -> Result<Box<dyn ConcatKernel>>;
}

/// Data type combinations every provider services.
pub(crate) fn check_conv_types(conf: &ConvConf) -> Result<()> {
    let unsupported = |what: &str, dt: DataType| {
        Err(OpError::Unsupported(format!(
            "{} data type {} with {} source",
            what, dt, conf.src_dtype
        )))
    };
    let float = match conf.src_dtype {
        DataType::F32 => true,
        DataType::U8 | DataType::S8 => false,
        DataType::S32 => return unsupported("source", DataType::S32),
    };
    let weight_ok = |dt: DataType| if float { dt == DataType::F32 } else { dt == DataType::S8 };
    let bias_ok = |dt: DataType| if float { dt == DataType::F32 } else { matches!(dt, DataType::S32 | DataType::F32) };

    if !weight_ok(conf.wei_dtype) {
        return unsupported("weight", conf.wei_dtype);
    }
    if let Some(dt) = conf.wei_1x1_dtype {
        if !weight_ok(dt) {
            return unsupported("1x1 weight", dt);
        }
    }
    for dt in [conf.bias_dtype, conf.bias_1x1_dtype].into_iter().flatten() {
        if !bias_ok(dt) {
            return unsupported("bias", dt);
        }
    }
    Ok(())
}

/// Typed slice of a bound tensor. The dtype was checked when the kernel was bound.
#[inline]
pub(crate) fn bound<T: Element>(t: &Tensor) -> &[T] {
    match t.data::<T>() {
        Ok(d) => d,
        Err(e) => panic!("bound tensor changed type after configuration: {}", e),
    }
}

#[inline]
pub(crate) fn bound_mut<T: Element>(t: &mut Tensor) -> &mut [T] {
    match t.data_mut::<T>() {
        Ok(d) => d,
        Err(e) => panic!("bound tensor changed type after configuration: {}", e),
    }
}

/// Per-channel bias widened to f64, zeros when absent.
pub(crate) fn load_bias(bias: Option<&Tensor>, channels: usize) -> Vec<f64> {
    match bias {
        Some(b) => (0..channels).map(|c| b.raw().load_f64(c)).collect(),
        None => vec![0.0; channels],
    }
}

/// Ordered providers with a cached choice.
pub struct KernelManager {
    providers: Vec<Arc<dyn KernelProvider>>,
    selected: OnceLock<usize>,
}

impl Default for KernelManager {
    fn default() -> Self {
        Self::with_providers(vec![
            Arc::new(OptimizedProvider::default()),
            Arc::new(ReferenceProvider),
        ])
    }
}

impl KernelManager {
    /// Providers are tried in the given order; the first available one wins.
    pub fn with_providers(providers: Vec<Arc<dyn KernelProvider>>) -> Self {
        Self {
            providers,
            selected: OnceLock::new(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let pool = match config.num_threads {
            Some(n) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .thread_name(|i| format!("qfuse-worker-{}", i))
                    .build()
                    .map_err(|e| OpError::Config(format!("thread pool: {}", e)))?;
                debug!("built dedicated pool with {} threads", n);
                Some(Arc::new(pool))
            }
            None => None,
        };
        let optimized: Arc<dyn KernelProvider> =
            Arc::new(OptimizedProvider::new(pool, config.parallel_threshold));
        let reference: Arc<dyn KernelProvider> = Arc::new(ReferenceProvider);
        let providers = match config.provider {
            ProviderKind::Auto => vec![optimized, reference],
            ProviderKind::Optimized => vec![optimized],
            ProviderKind::Reference => vec![reference],
        };
        Ok(Self::with_providers(providers))
    }

    /// Process-wide manager configured from the environment.
    pub fn global() -> Arc<KernelManager> {
        static GLOBAL: OnceLock<Arc<KernelManager>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| {
                let manager = EngineConfig::from_env().and_then(|c| KernelManager::from_config(&c));
                match manager {
                    Ok(m) => Arc::new(m),
                    Err(e) => {
                        warn!("ignoring engine config from environment: {}", e);
                        Arc::new(KernelManager::default())
                    }
                }
            })
            .clone()
    }

    pub fn select_best(&self) -> Result<Arc<dyn KernelProvider>> {
        let idx = *self.selected.get_or_init(|| {
            for (i, provider) in self.providers.iter().enumerate() {
                if provider.is_available() {
                    info!("Selected kernel provider: {}", provider.name());
                    return i;
                }
            }
            error!("No available kernel provider found");
            usize::MAX
        });
        self.providers.get(idx).cloned().ok_or(OpError::Binding {
            provider: "manager",
            reason: "no available kernel provider".to_string(),
        })
    }

    pub fn selected_provider_name(&self) -> Option<&'static str> {
        self.selected
            .get()
            .and_then(|&idx| self.providers.get(idx))
            .map(|p| p.name())
    }

    pub fn list_available_providers(&self) -> Vec<&'static str> {
        self.providers
            .iter()
            .filter(|p| p.is_available())
            .map(|p| p.name())
            .collect()
    }
}
