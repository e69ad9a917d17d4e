//! Free-text counterparty resolution and directory administration

use tracing::debug;
use uuid::Uuid;

use crate::traits::*;
use crate::types::*;
use crate::utils::hint_cache::HintCache;
use crate::utils::validation;

/// Case-normalize a free-text name for exact matching
pub fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Outcome of resolving a free-text counterparty name
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Matched(Counterparty),
    Unmatched(String),
}

impl MatchOutcome {
    pub fn counterparty(&self) -> Option<&Counterparty> {
        match self {
            MatchOutcome::Matched(cp) => Some(cp),
            MatchOutcome::Unmatched(_) => None,
        }
    }
}

/// Resolves free-text names to counterparty identities: exact name match
/// first, then exact alias match, both case-normalized.
///
/// A small hint cache remembers recent hits, but every hint is re-validated
/// against the store before use; the cache is never a source of truth.
pub struct CounterpartyMatcher<S: LedgerStore> {
    store: S,
    hints: HintCache,
}

impl<S: LedgerStore> CounterpartyMatcher<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            hints: HintCache::new(16),
        }
    }

    /// Resolve a free-text name. Soft-deleted counterparties never match.
    pub async fn resolve(&mut self, free_text: &str) -> EngineResult<MatchOutcome> {
        let normalized = normalize(free_text);
        if normalized.is_empty() {
            return Ok(MatchOutcome::Unmatched(free_text.to_string()));
        }

        if let Some(id) = self.hints.hint(&normalized) {
            if let Some(cp) = self.store.get_counterparty(id).await? {
                if !cp.is_deleted() && Self::matches(&cp, &normalized) {
                    return Ok(MatchOutcome::Matched(cp));
                }
            }
            // stale hint, fall through to the store
            self.hints.forget(&normalized);
        }

        let found = match self.store.find_counterparty_by_name(&normalized).await? {
            Some(cp) => Some(cp),
            None => self.store.find_counterparty_by_alias(&normalized).await?,
        };

        match found {
            Some(cp) if !cp.is_deleted() => {
                self.hints.note(&normalized, cp.id);
                Ok(MatchOutcome::Matched(cp))
            }
            _ => Ok(MatchOutcome::Unmatched(free_text.to_string())),
        }
    }

    fn matches(cp: &Counterparty, normalized: &str) -> bool {
        normalize(&cp.name) == normalized || cp.aliases.iter().any(|a| normalize(a) == normalized)
    }
}

/// Administrative operations on the counterparty directory, in the mold of a
/// manager owning its storage handle.
pub struct CounterpartyDirectory<S: LedgerStore> {
    store: S,
    audit: Box<dyn AuditSink>,
}

impl<S: LedgerStore> CounterpartyDirectory<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            audit: Box::new(NullAuditSink),
        }
    }

    pub fn with_audit(store: S, audit: Box<dyn AuditSink>) -> Self {
        Self { store, audit }
    }

    /// Create a counterparty named after unmatched free text, so that future
    /// imports resolve it automatically.
    pub async fn create_from_unmatched(
        &mut self,
        name: &str,
        actor: &str,
    ) -> EngineResult<Counterparty> {
        self.create(name, CounterpartyKind::Both, actor).await
    }

    /// Create a new counterparty, rejecting names already taken by another
    /// counterparty's name or alias.
    pub async fn create(
        &mut self,
        name: &str,
        kind: CounterpartyKind,
        actor: &str,
    ) -> EngineResult<Counterparty> {
        validation::validate_name(name)?;
        self.ensure_name_free(name, None).await?;

        let counterparty = Counterparty::new(name.trim().to_string(), kind);
        self.store.save_counterparty(&counterparty).await?;
        debug!(counterparty = %counterparty.id, name = %counterparty.name, "counterparty created");

        self.audit
            .emit(AuditRecord::new(
                "counterparty.create",
                actor,
                counterparty.id,
                format!("created '{}'", counterparty.name),
            ))
            .await?;
        Ok(counterparty)
    }

    /// Register free text as a permanent alias of an existing counterparty
    pub async fn link_alias(
        &mut self,
        free_text: &str,
        counterparty_id: Uuid,
        actor: &str,
    ) -> EngineResult<Counterparty> {
        validation::validate_name(free_text)?;
        let mut counterparty = self.require(counterparty_id).await?;
        if counterparty.is_deleted() {
            return Err(EngineError::Validation(format!(
                "counterparty '{}' is deleted",
                counterparty.name
            )));
        }
        self.ensure_name_free(free_text, Some(counterparty_id)).await?;

        counterparty.aliases.push(free_text.trim().to_string());
        self.write(&mut counterparty).await?;

        self.audit
            .emit(AuditRecord::new(
                "counterparty.link_alias",
                actor,
                counterparty_id,
                format!("linked alias '{}'", free_text.trim()),
            ))
            .await?;
        Ok(counterparty)
    }

    /// Remove an alias; matching is case-normalized
    pub async fn remove_alias(
        &mut self,
        alias: &str,
        counterparty_id: Uuid,
        actor: &str,
    ) -> EngineResult<Counterparty> {
        let mut counterparty = self.require(counterparty_id).await?;
        let normalized = normalize(alias);
        let before = counterparty.aliases.len();
        counterparty.aliases.retain(|a| normalize(a) != normalized);
        if counterparty.aliases.len() == before {
            return Err(EngineError::Validation(format!(
                "counterparty '{}' has no alias '{}'",
                counterparty.name, alias
            )));
        }
        self.write(&mut counterparty).await?;

        self.audit
            .emit(AuditRecord::new(
                "counterparty.remove_alias",
                actor,
                counterparty_id,
                format!("removed alias '{alias}'"),
            ))
            .await?;
        Ok(counterparty)
    }

    /// Rename a counterparty, keeping the name unique
    pub async fn rename(
        &mut self,
        counterparty_id: Uuid,
        new_name: &str,
        actor: &str,
    ) -> EngineResult<Counterparty> {
        validation::validate_name(new_name)?;
        let mut counterparty = self.require(counterparty_id).await?;
        self.ensure_name_free(new_name, Some(counterparty_id)).await?;

        let old_name = counterparty.name.clone();
        counterparty.name = new_name.trim().to_string();
        self.write(&mut counterparty).await?;

        self.audit
            .emit(AuditRecord::new(
                "counterparty.rename",
                actor,
                counterparty_id,
                format!("renamed '{}' to '{}'", old_name, new_name.trim()),
            ))
            .await?;
        Ok(counterparty)
    }

    /// Toggle the active flag
    pub async fn set_active(
        &mut self,
        counterparty_id: Uuid,
        active: bool,
        actor: &str,
    ) -> EngineResult<Counterparty> {
        let mut counterparty = self.require(counterparty_id).await?;
        counterparty.active = active;
        self.write(&mut counterparty).await?;

        self.audit
            .emit(AuditRecord::new(
                "counterparty.set_active",
                actor,
                counterparty_id,
                format!("active = {active}"),
            ))
            .await?;
        Ok(counterparty)
    }

    /// Soft-delete with a mandatory reason. The record stays in the store
    /// while vouchers reference it; it stops matching and rejects new
    /// transactions.
    pub async fn soft_delete(
        &mut self,
        counterparty_id: Uuid,
        reason: &str,
        actor: &str,
    ) -> EngineResult<Counterparty> {
        validation::validate_reason(reason)?;
        let mut counterparty = self.require(counterparty_id).await?;
        counterparty.deleted_reason = Some(reason.to_string());
        counterparty.active = false;
        self.write(&mut counterparty).await?;

        self.audit
            .emit(AuditRecord::new(
                "counterparty.soft_delete",
                actor,
                counterparty_id,
                reason.to_string(),
            ))
            .await?;
        Ok(counterparty)
    }

    /// Get a counterparty by id
    pub async fn get(&self, counterparty_id: Uuid) -> EngineResult<Option<Counterparty>> {
        self.store.get_counterparty(counterparty_id).await
    }

    async fn require(&self, id: Uuid) -> EngineResult<Counterparty> {
        self.store
            .get_counterparty(id)
            .await?
            .ok_or(EngineError::CounterpartyNotFound(id))
    }

    async fn ensure_name_free(&self, name: &str, except: Option<Uuid>) -> EngineResult<()> {
        let normalized = normalize(name);
        let taken = match self.store.find_counterparty_by_name(&normalized).await? {
            Some(cp) => Some(cp),
            None => self.store.find_counterparty_by_alias(&normalized).await?,
        };
        if let Some(cp) = taken {
            if Some(cp.id) != except {
                return Err(EngineError::Validation(format!(
                    "'{}' is already used by counterparty '{}'",
                    name.trim(),
                    cp.name
                )));
            }
        }
        Ok(())
    }

    async fn write(&mut self, counterparty: &mut Counterparty) -> EngineResult<()> {
        let expected_version = counterparty.version;
        counterparty.updated_at = chrono::Utc::now().naive_utc();
        let mut batch = LedgerBatch::default();
        batch
            .update_counterparties
            .push(VersionedWrite::new(counterparty.clone(), expected_version));
        self.store.apply_batch(batch).await
    }
}
