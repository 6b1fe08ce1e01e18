//! Federation protocol layer
//!
//! Handles:
//! - HTTP message signatures (two standards)
//! - Actor resolution and caching
//! - WebFinger discovery
//! - Follower/following registry
//! - Outbox fan-out and background delivery

pub mod activity;
pub mod directory;
pub mod inbox;
pub mod outbox;
pub mod registry;
pub mod scheduler;
pub mod signature;
pub mod webfinger;

pub use activity::{Activity, PUBLIC_AUDIENCE, audience_for_visibility, builder};
pub use directory::{ActorDirectory, ResolutionError};
pub use inbox::InboxProcessor;
pub use outbox::{DispatchReceipt, OutboxDispatcher};
pub use registry::{FollowRegistry, RegistryError};
pub use scheduler::{DeliveryError, DeliveryScheduler};
pub use signature::{
    SignatureError, SignatureScheme, SignatureVerifier, SignedHeaders, SkewWindow,
    VerifiedIdentity, key_id_matches_actor, sign_request,
};
pub use webfinger::{ResolvedHandle, WebFingerResolver, local_descriptor};
