//! Wire format definitions for duet.
//!
//! Everything that crosses the relay boundary lives here: typed
//! identifiers, the portable key structure, REST request/response bodies,
//! live-channel events and the claims carried by session credentials.
//! All JSON field names are camelCase; byte fields (nonce, ciphertext)
//! travel as plain arrays of numbers.

#![forbid(unsafe_code)]

pub mod api;
pub mod claims;
pub mod events;
pub mod ids;
pub mod keys;
pub mod validation;

#[cfg(test)]
mod proptests;

pub use api::{
    ConversationView, ErrorBody, KeyResponse, MessageView, PostMessageRequest, PublishKeyRequest,
    StartConversationRequest, UserSummary,
};
pub use claims::SessionClaims;
pub use events::{ClientEvent, ServerEvent};
pub use ids::{ConversationId, MessageId, UserId};
pub use keys::PortableKey;
