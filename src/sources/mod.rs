//! Provider adapters.
//!
//! Each adapter implements [`LookupSource`]: it knows its provider's
//! endpoints, maps provider errors onto [`SourceError`] and returns a
//! provider-shaped [`RawPayload`]. Normalization happens later.

pub mod core;
pub mod getcontact;
pub mod instagram;
pub mod vk;
pub mod whatsapp;
pub mod whocalls;

pub use self::core::{
    AttemptFeedback, CallerIdPayload, FetchContext, FetchResult, LookupSource, NotFoundKind,
    Pacing, ProfilePayload, ProviderId, Query, QueryError, QueryKind, RawPayload, SourceError,
    default_photo_headers, rotating_user_agent,
};
pub use getcontact::GetContactSource;
pub use instagram::InstagramSource;
pub use vk::VkSource;
pub use whatsapp::WhatsAppSource;
pub use whocalls::WhoCallsSource;
