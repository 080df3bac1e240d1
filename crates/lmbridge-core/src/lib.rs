pub mod channels;
pub mod http;
pub mod lifecycle;
pub mod monitoring;
pub mod respond;
pub mod state;
pub mod stream;
pub mod tabs;
pub mod tokens;
pub mod translate;

pub use channels::{ChannelBroker, ChannelFrame, PendingRequest};
pub use http::{BridgeHttpClient, HttpBody, HttpResponse};
pub use lifecycle::{PendingItem, PendingQueue, VerificationGuard};
pub use monitoring::{MonitoringService, RequestLogSink, RequestOutcome, RequestRecord};
pub use respond::{BridgeResponse, ResponseBody};
pub use state::{AppState, CaptureState};
pub use stream::{ProcessorEvent, UsageTally};
pub use tabs::TabRegistry;
pub use translate::{TranslationInput, build_arena_payload};
