//! Trailer authentication checks.
//!
//! Signature verification itself belongs to the deployment (key material never
//! lives in this crate). What the receiver enforces is the policy around it: which
//! key identifiers are acceptable and whether unsigned frames are tolerated.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::types::{Frame, FrameBody};
use crate::{Cd11Error, Result};

/// Decides whether a decoded frame may be processed.
pub trait FrameAuthenticator: Send + Sync + 'static {
    /// `raw` is the complete frame as received.
    fn verify(&self, frame: &Frame, raw: &[u8]) -> Result<()>;
}

/// Authenticator used when authentication is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl FrameAuthenticator for AcceptAll {
    fn verify(&self, _frame: &Frame, _raw: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Accepts frames signed with an allowed key identifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyAllowList {
    pub allowed_key_ids: HashSet<u32>,
    /// Reject frames with an empty signature.
    pub require_signature: bool,
}

impl KeyAllowList {
    pub fn new(allowed_key_ids: impl IntoIterator<Item = u32>, require_signature: bool) -> Self {
        Self { allowed_key_ids: allowed_key_ids.into_iter().collect(), require_signature }
    }

    fn check(&self, key_id: u32, signature: &[u8]) -> Result<()> {
        if !self.allowed_key_ids.contains(&key_id) {
            return Err(Cd11Error::authentication(key_id, "key identifier not allowed"));
        }
        if self.require_signature && signature.is_empty() {
            return Err(Cd11Error::authentication(key_id, "missing signature"));
        }
        Ok(())
    }
}

impl FrameAuthenticator for KeyAllowList {
    fn verify(&self, frame: &Frame, _raw: &[u8]) -> Result<()> {
        self.check(frame.trailer.auth_key_id, &frame.trailer.auth_value)?;

        if let FrameBody::Data(data) = &frame.body {
            for subframe in data.subframes.iter().filter(|s| s.description.authenticated) {
                self.check(subframe.auth_key_id, &subframe.auth_value)?;
            }
        }
        Ok(())
    }
}
