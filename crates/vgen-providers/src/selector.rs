//! Tiered provider selection with bounded liveness probing.
//!
//! Ordering is data-driven: a [`PriorityTable`] maps each profile to an
//! ordered list of tiers, and optionally pins an explicit provider order per
//! capability. [`select_chain`] is a pure function of the table and the
//! current descriptors; [`ProviderSelector`] adds probing and a cache of the
//! most recent descriptor per provider.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use metrics::counter;
use tracing::{debug, info, warn};

use vgen_models::{
    Capability, ProbeAttempt, ProviderDescriptor, ProviderProfile, ProviderTier,
};

use crate::error::NoProviderAvailable;
use crate::probe::ProbeOutcome;
use crate::provider::Provider;

/// Upper bound on a single liveness probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a probe result is trusted before re-probing.
pub const DEFAULT_PROBE_FRESHNESS: Duration = Duration::from_secs(60);

/// Tier order per profile plus optional explicit provider order.
#[derive(Debug, Clone)]
pub struct PriorityTable {
    tiers: HashMap<ProviderProfile, Vec<ProviderTier>>,
    provider_order: HashMap<Capability, Vec<String>>,
}

impl Default for PriorityTable {
    fn default() -> Self {
        let mut tiers = HashMap::new();
        tiers.insert(
            ProviderProfile::OfflinePreferred,
            vec![ProviderTier::Local, ProviderTier::Free, ProviderTier::Paid],
        );
        tiers.insert(
            ProviderProfile::QualityPreferred,
            vec![ProviderTier::Paid, ProviderTier::Local, ProviderTier::Free],
        );
        Self {
            tiers,
            provider_order: HashMap::new(),
        }
    }
}

impl PriorityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the tier order for a profile. Tiers left out are disabled
    /// for that profile.
    pub fn with_tiers(mut self, profile: ProviderProfile, tiers: Vec<ProviderTier>) -> Self {
        let mut deduped = Vec::with_capacity(tiers.len());
        for tier in tiers {
            if !deduped.contains(&tier) {
                deduped.push(tier);
            }
        }
        self.tiers.insert(profile, deduped);
        self
    }

    /// Pin the order of named providers within a tier. Unlisted providers
    /// keep registration order after the listed ones.
    pub fn with_provider_order<I, S>(mut self, capability: Capability, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.provider_order
            .insert(capability, names.into_iter().map(Into::into).collect());
        self
    }

    pub fn tiers(&self, profile: ProviderProfile) -> &[ProviderTier] {
        self.tiers.get(&profile).map(Vec::as_slice).unwrap_or(&[])
    }

    fn tier_rank(&self, profile: ProviderProfile, tier: ProviderTier) -> Option<usize> {
        self.tiers(profile).iter().position(|t| *t == tier)
    }

    fn provider_rank(&self, capability: Capability, name: &str) -> usize {
        self.provider_order
            .get(&capability)
            .and_then(|order| order.iter().position(|n| n == name))
            .unwrap_or(usize::MAX)
    }
}

/// Rank descriptors for a profile and keep the live ones.
///
/// Descriptors must be given in registration order; ties are broken by it.
/// Fails with every rejected candidate and its reason when nothing is live.
pub fn select_chain(
    table: &PriorityTable,
    profile: ProviderProfile,
    capability: Capability,
    descriptors: &[ProviderDescriptor],
) -> Result<Vec<ProviderDescriptor>, NoProviderAvailable> {
    let mut live = Vec::new();
    let mut rejected = Vec::new();

    for (index, descriptor) in descriptors.iter().enumerate() {
        let tier_rank = match table.tier_rank(profile, descriptor.tier) {
            Some(rank) => rank,
            None => {
                rejected.push(ProbeAttempt {
                    provider: descriptor.name.clone(),
                    tier: descriptor.tier,
                    reason: format!("{} tier disabled for {}", descriptor.tier, profile),
                });
                continue;
            }
        };
        if !descriptor.available {
            rejected.push(ProbeAttempt {
                provider: descriptor.name.clone(),
                tier: descriptor.tier,
                reason: descriptor
                    .reason
                    .clone()
                    .unwrap_or_else(|| "probe failed".to_string()),
            });
            continue;
        }
        let key = (
            tier_rank,
            table.provider_rank(capability, &descriptor.name),
            index,
        );
        live.push((key, descriptor.clone()));
    }

    if live.is_empty() {
        return Err(NoProviderAvailable {
            capability,
            attempts: rejected,
        });
    }

    live.sort_by_key(|(key, _)| *key);
    Ok(live.into_iter().map(|(_, d)| d).collect())
}

#[derive(Debug, Clone)]
struct CachedProbe {
    descriptor: ProviderDescriptor,
    checked: Instant,
}

/// Probes providers and returns ranked fallback chains.
pub struct ProviderSelector {
    table: PriorityTable,
    probe_timeout: Duration,
    freshness: Duration,
    cache: RwLock<HashMap<(Capability, String), CachedProbe>>,
}

impl Default for ProviderSelector {
    fn default() -> Self {
        Self::new(PriorityTable::default())
    }
}

impl ProviderSelector {
    pub fn new(table: PriorityTable) -> Self {
        Self {
            table,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            freshness: DEFAULT_PROBE_FRESHNESS,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_freshness(mut self, freshness: Duration) -> Self {
        self.freshness = freshness;
        self
    }

    pub fn table(&self) -> &PriorityTable {
        &self.table
    }

    /// Live candidates for `capability`, best first.
    ///
    /// Candidates without a fresh probe result are probed concurrently, each
    /// bounded by the probe timeout.
    pub async fn chain<P>(
        &self,
        capability: Capability,
        profile: ProviderProfile,
        candidates: &[Arc<P>],
    ) -> Result<Vec<Arc<P>>, NoProviderAvailable>
    where
        P: Provider + ?Sized,
    {
        let descriptors = self.descriptors_for(candidates, false).await;
        let ranked = match select_chain(&self.table, profile, capability, &descriptors) {
            Ok(ranked) => ranked,
            Err(err) => {
                warn!(%capability, %profile, "{}", err);
                return Err(err);
            }
        };

        debug!(
            %capability,
            %profile,
            chain = ?ranked.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
            "Provider chain selected"
        );

        Ok(ranked
            .iter()
            .filter_map(|d| candidates.iter().find(|p| p.name() == d.name).cloned())
            .collect())
    }

    /// Best live candidate for `capability`.
    pub async fn select<P>(
        &self,
        capability: Capability,
        profile: ProviderProfile,
        candidates: &[Arc<P>],
    ) -> Result<Arc<P>, NoProviderAvailable>
    where
        P: Provider + ?Sized,
    {
        let chain = self.chain(capability, profile, candidates).await?;
        chain.into_iter().next().ok_or(NoProviderAvailable {
            capability,
            attempts: Vec::new(),
        })
    }

    /// Re-probe every candidate regardless of cache age.
    pub async fn refresh<P>(&self, candidates: &[Arc<P>]) -> Vec<ProviderDescriptor>
    where
        P: Provider + ?Sized,
    {
        self.descriptors_for(candidates, true).await
    }

    async fn descriptors_for<P>(&self, candidates: &[Arc<P>], force: bool) -> Vec<ProviderDescriptor>
    where
        P: Provider + ?Sized,
    {
        let probes = candidates.iter().map(|provider| async move {
            if !force {
                if let Some(cached) = self.fresh(provider.capability(), provider.name()) {
                    return cached;
                }
            }
            self.probe(&**provider).await
        });
        join_all(probes).await
    }

    /// Probe one provider with the configured timeout and cache the result.
    pub async fn probe<P>(&self, provider: &P) -> ProviderDescriptor
    where
        P: Provider + ?Sized,
    {
        let outcome = match tokio::time::timeout(self.probe_timeout, provider.probe()).await {
            Ok(outcome) => outcome,
            Err(_) => ProbeOutcome::down(format!(
                "probe timed out after {}ms",
                self.probe_timeout.as_millis()
            )),
        };

        let descriptor = match (outcome.available, outcome.reason) {
            (true, _) => ProviderDescriptor::up(provider.capability(), provider.name(), provider.tier()),
            (false, reason) => ProviderDescriptor::down(
                provider.capability(),
                provider.name(),
                provider.tier(),
                reason.unwrap_or_else(|| "probe failed".to_string()),
            ),
        };

        counter!(
            "vgen_provider_probes_total",
            "capability" => descriptor.capability.as_str(),
            "provider" => descriptor.name.clone(),
            "result" => if descriptor.available { "up" } else { "down" }
        )
        .increment(1);

        if !descriptor.available {
            debug!(
                provider = %descriptor.name,
                reason = descriptor.reason.as_deref().unwrap_or_default(),
                "Provider probed down"
            );
        }

        self.store(descriptor.clone());
        descriptor
    }

    /// Record a provider as down until the freshness window expires.
    pub fn mark_unavailable(
        &self,
        capability: Capability,
        name: &str,
        tier: ProviderTier,
        reason: impl Into<String>,
    ) {
        let descriptor = ProviderDescriptor::down(capability, name, tier, reason);
        info!(
            %capability,
            provider = name,
            reason = descriptor.reason.as_deref().unwrap_or_default(),
            "Provider marked unavailable"
        );
        self.store(descriptor);
    }

    /// Most recent descriptor of every probed provider.
    pub fn snapshot(&self) -> Vec<ProviderDescriptor> {
        let cache = self.cache.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut descriptors: Vec<_> = cache.values().map(|c| c.descriptor.clone()).collect();
        descriptors.sort_by(|a, b| {
            (a.capability.as_str(), a.name.as_str()).cmp(&(b.capability.as_str(), b.name.as_str()))
        });
        descriptors
    }

    fn fresh(&self, capability: Capability, name: &str) -> Option<ProviderDescriptor> {
        let cache = self.cache.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        cache
            .get(&(capability, name.to_string()))
            .filter(|c| c.checked.elapsed() < self.freshness)
            .map(|c| c.descriptor.clone())
    }

    fn store(&self, descriptor: ProviderDescriptor) {
        let key = (descriptor.capability, descriptor.name.clone());
        let mut cache = self.cache.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.insert(
            key,
            CachedProbe {
                descriptor,
                checked: Instant::now(),
            },
        );
    }
}
