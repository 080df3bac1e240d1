mod binding;
mod jsonc;
mod store;
mod types;
mod watcher;

pub use binding::{
    DirectApiType, DirectBinding, EndpointEntry, ModelKind, Pricing, SessionBinding, SessionMode,
};
pub use jsonc::{ConfigParseError, parse_jsonc};
pub use store::{ConfigPaths, ConfigStore, FallbackModel};
pub use types::{
    BridgeConfig, BypassInjection, CacheConfig, DownloadTimeouts, EmptyResponseRetry,
    FilebedEndpoint, FilebedStrategy, ImageCompression, ImageOptimization, ImageReturnMode,
    InjectionMessage, InjectionSpec, LocalSaveFormat, ReasoningMode, RoleConversionMode,
    VerificationConfig,
};
pub use watcher::watch_config_files;
