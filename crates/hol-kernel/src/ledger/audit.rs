use super::*;

use crate::receipts::{AppendOutcome, ReceiptDraft, ReceiptStatus};

/// What a successful operation commits to in its receipt.
pub trait Bundled {
    fn bundle_hash(&self) -> Hash;

    /// Chain tick the operation produced, used as the dedupe state version.
    fn state_version(&self) -> Option<Tick> {
        None
    }
}

impl Bundled for Delta {
    fn bundle_hash(&self) -> Hash {
        self.compute_hash().unwrap_or(Hash::ZERO)
    }

    fn state_version(&self) -> Option<Tick> {
        Some(self.tick)
    }
}

impl Bundled for Anchor {
    fn bundle_hash(&self) -> Hash {
        self.checkpoint_id
    }

    fn state_version(&self) -> Option<Tick> {
        Some(self.tick)
    }
}

impl Bundled for Vec<Anchor> {
    fn bundle_hash(&self) -> Hash {
        let ids: Vec<&[u8]> = self.iter().map(|a| a.checkpoint_id.as_bytes().as_slice()).collect();
        Hash::of_parts(&ids)
    }
}

impl Bundled for Vec<Tick> {
    fn bundle_hash(&self) -> Hash {
        let bytes: Vec<u8> = self.iter().flat_map(|t| t.to_le_bytes()).collect();
        Hash::of_parts(&[b"ticks", &bytes])
    }
}

impl Bundled for StateVector {
    fn bundle_hash(&self) -> Hash {
        self.state_hash()
    }
}

pub(crate) struct OpAudit {
    pub op_kind: &'static str,
    pub chain: ChainId,
    pub selectors: Hash,
}

impl<S: Store + 'static> StateLedger<S> {
    pub(crate) fn audit<T: Serialize>(&self, op_kind: &'static str, chain: &ChainId, selectors: &T) -> OpAudit {
        let selectors = self
            .codec
            .canonical_hash(selectors)
            .or_else(|_| Hash::of_cbor(selectors))
            .unwrap_or(Hash::ZERO);
        OpAudit {
            op_kind,
            chain: chain.clone(),
            selectors,
        }
    }

    /// Commitment to the policy a chain ran under: its tier and the ledger
    /// thresholds that shape promotion and numeric checks.
    pub(crate) fn policy_hash(&self, tier: Option<DeterminismTier>) -> Hash {
        #[derive(Serialize)]
        struct PolicyView<'a> {
            tier: Option<DeterminismTier>,
            chain_length_threshold: u64,
            k_max: u64,
            ulp_budget: u32,
            quantum_decimals: u32,
            tenant: &'a str,
        }
        Hash::of_cbor(&PolicyView {
            tier,
            chain_length_threshold: self.config.chain_length_threshold,
            k_max: self.config.k_max,
            ulp_budget: self.config.ulp_budget,
            quantum_decimals: self.config.quantum_decimals,
            tenant: &self.config.tenant,
        })
        .unwrap_or(Hash::ZERO)
    }

    /// Record the outcome of an operation. Successful operations get a
    /// deduplicated OK receipt; failures get a rejected receipt and the error
    /// is handed back unchanged.
    pub(crate) fn finish<T: Bundled>(
        &self,
        audit: OpAudit,
        tier: Option<DeterminismTier>,
        result: LedgerResult<T>,
    ) -> LedgerResult<T> {
        match result {
            Ok(value) => {
                let dedupe_key = value.state_version().map(|version| {
                    ReceiptCodec::dedupe_key(&self.config.tenant, audit.chain.as_str(), version, audit.op_kind)
                });
                self.record_receipt(ReceiptDraft {
                    op_kind: audit.op_kind.to_string(),
                    tenant: self.config.tenant.clone(),
                    chain_id: audit.chain,
                    logical_timestamp: 0,
                    selectors_hash: audit.selectors,
                    policy_hash: self.policy_hash(tier),
                    bundle_hash: value.bundle_hash(),
                    status: ReceiptStatus::Ok,
                    dedupe_key,
                    inbound: None,
                })?;
                Ok(value)
            }
            Err(err) => Err(self.record_failure(audit, tier, err)),
        }
    }

    pub(crate) fn record_failure(&self, audit: OpAudit, tier: Option<DeterminismTier>, err: LedgerError) -> LedgerError {
        let draft = ReceiptDraft {
            op_kind: audit.op_kind.to_string(),
            tenant: self.config.tenant.clone(),
            chain_id: audit.chain,
            logical_timestamp: 0,
            selectors_hash: audit.selectors,
            policy_hash: self.policy_hash(tier),
            bundle_hash: Hash::of_parts(&[b"error", err.code().as_bytes()]),
            status: ReceiptStatus::Rejected {
                code: err.code().to_string(),
                message: err.to_string(),
            },
            dedupe_key: None,
            inbound: None,
        };
        if let Err(receipt_err) = self.record_receipt(draft) {
            log::warn!("could not record rejected {} receipt: {receipt_err}", audit.op_kind);
        }
        err
    }

    /// Seal, deduplicate, journal and index a receipt. The logical timestamp
    /// is assigned here.
    pub(crate) fn record_receipt(&self, mut draft: ReceiptDraft) -> LedgerResult<AppendOutcome> {
        let mut log = self.receipt_log();
        if let Some(existing) = draft.dedupe_key.and_then(|key| log.by_dedupe_key(&key)) {
            return Ok(AppendOutcome::Duplicate(existing.clone()));
        }
        draft.logical_timestamp = self.clock.advance();
        let receipt = self.codec.seal(draft)?;
        self.journal_record(&LedgerRecord::Receipt(receipt.clone()))?;
        Ok(log.append(receipt))
    }

    /// Bring in a receipt sealed elsewhere (recipe replay). The receipt must
    /// verify against this ledger's codec.
    pub(crate) fn import_receipt(&self, receipt: &Receipt) -> LedgerResult<AppendOutcome> {
        if !self.codec.verify(receipt)? {
            return Err(LedgerError::corrupted(
                &receipt.chain_id,
                format!("receipt {} does not match its canonical hash", receipt.rid.short()),
            ));
        }
        let mut log = self.receipt_log();
        if let Some(existing) = log.duplicate_of(receipt) {
            return Ok(AppendOutcome::Duplicate(existing.clone()));
        }
        self.journal_record(&LedgerRecord::Receipt(receipt.clone()))?;
        self.clock.observe(receipt.logical_timestamp);
        Ok(log.append(receipt.clone()))
    }
}
