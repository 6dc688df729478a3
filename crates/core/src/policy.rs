//! Premium registry and tier resolution.

use std::sync::Arc;
use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use crate::config::{TierConfig, TierLimits};
use crate::error::StorageResult;
use crate::identity::Identity;
use crate::store::KeyValueStore;

/// Entry in the premium set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PremiumGrant {
    pub identity: Identity,
    pub granted_at: DateTime<Utc>,
}

/// Identities entitled to the premium tier.
///
/// Grants never expire on their own; the payment collaborator decides when
/// to revoke.
pub struct PremiumRegistry {
    grants: Arc<dyn KeyValueStore<PremiumGrant>>,
}

impl PremiumRegistry {
    pub fn new(grants: Arc<dyn KeyValueStore<PremiumGrant>>) -> Self {
        PremiumRegistry { grants }
    }

    /// Returns false if the identity was already premium
    pub fn grant(&self, identity: &Identity) -> StorageResult<bool> {
        if self.grants.get(identity.as_str())?.is_some() {
            return Ok(false);
        }
        self.grants.set(
            identity.as_str(),
            PremiumGrant {
                identity: identity.clone(),
                granted_at: Utc::now(),
            },
        )?;
        info!("Premium granted to {}", identity);
        Ok(true)
    }

    /// Returns false if the identity was not premium
    pub fn revoke(&self, identity: &Identity) -> StorageResult<bool> {
        let removed = self.grants.delete(identity.as_str())?.is_some();
        if removed {
            info!("Premium revoked for {}", identity);
        }
        Ok(removed)
    }

    pub fn is_premium(&self, identity: &Identity) -> StorageResult<bool> {
        Ok(self.grants.get(identity.as_str())?.is_some())
    }

    pub fn count(&self) -> StorageResult<usize> {
        self.grants.len()
    }
}

/// Effective limits for one identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierPolicy {
    pub is_premium: bool,
    pub max_upload_bytes: u64,
    /// `None` means unlimited
    pub quota_per_window: Option<u32>,
}

/// Maps identities to tier limits
pub struct TierPolicyResolver {
    tiers: TierConfig,
    premium: Arc<PremiumRegistry>,
}

impl TierPolicyResolver {
    pub fn new(tiers: TierConfig, premium: Arc<PremiumRegistry>) -> Self {
        TierPolicyResolver { tiers, premium }
    }

    pub fn resolve(&self, identity: &Identity) -> StorageResult<TierPolicy> {
        let is_premium = self.premium.is_premium(identity)?;
        let TierLimits {
            max_upload_bytes,
            quota_per_window,
        } = if is_premium {
            self.tiers.premium.clone()
        } else {
            self.tiers.free.clone()
        };

        Ok(TierPolicy {
            is_premium,
            max_upload_bytes,
            quota_per_window,
        })
    }
}
