pub mod backfill;
pub mod detector;
pub mod engagement;
pub mod ingest;
pub mod push;
pub mod reconciler;
pub mod sweeper;
pub mod sync;

pub use detector::{detect_reply, strip_reply_prefix, Verdict};
pub use engagement::{engagement_signal, record_engagement};
pub use ingest::{ingest, IncomingSignal, Ingested, SignalKind, SignalPayload};
pub use push::{process_notifications, WebhookReport};
pub use reconciler::{ExpiryReport, Outcome, Reconciler};
pub use sync::{sync_all_pending_replies, sync_user_pending_replies, SyncReport};
pub use sweeper::run;
