use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::history::{HistoryIter, HistoryReconstructor, HistoryVerification};
use crate::registry::UserRegistry;
use crate::store::RecordStore;
use crate::substrate::{CommitMeta, LedgerKey, LedgerSubstrate, TxContext, WriteSet};
use crate::validator::StageValidator;
use crate::{
    Caller, DriverInput, FactoryInput, FarmerInput, Fruit, HistoryQueryResult, ProvenanceError,
    ShopInput, Stage, StageState, StageSubmission, TraceabilityCode, TxId, User, UserId, UserType,
};

/// Outcome of an accepted stage submission.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StageReceipt {
    pub traceability_code: TraceabilityCode,
    pub stage: Stage,
    pub state: StageState,
    pub tx_id: TxId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// The operations exposed to front-ends, each a single transaction against
/// the substrate.
pub struct ProvenanceLedger<L> {
    substrate: L,
    validator: StageValidator,
}

impl<L: LedgerSubstrate> ProvenanceLedger<L> {
    pub fn new(substrate: L) -> Self {
        Self { substrate, validator: StageValidator }
    }

    pub fn substrate(&self) -> &L {
        &self.substrate
    }

    /// # Errors
    /// - [`ProvenanceError::Validation`] when `real_info_hash` is not a content hash.
    /// - [`ProvenanceError::DuplicateUser`] when `user_id` is taken.
    /// - [`ProvenanceError::Conflict`] when a concurrent registration won the race.
    pub fn register_user(
        &self,
        user_id: UserId,
        user_type: UserType,
        real_info_hash: String,
    ) -> Result<User, ProvenanceError> {
        let registry = UserRegistry::new(&self.substrate);
        let ctx = self.substrate.begin()?;
        let mut write_set = WriteSet::new();
        let user = registry.stage_register(&mut write_set, user_id, user_type, real_info_hash)?;
        let meta = self.commit(ctx, write_set)?;
        info!(user_id = %user.user_id, user_type = %user.user_type, tx_id = %meta.tx_id, "user registered");
        Ok(user)
    }

    /// # Errors
    /// As [`Self::submit_stage`].
    pub fn submit_farmer_stage(
        &self,
        caller: &Caller,
        code: &TraceabilityCode,
        input: FarmerInput,
    ) -> Result<StageReceipt, ProvenanceError> {
        self.submit_stage(caller, code, StageSubmission::Farmer(input))
    }

    /// # Errors
    /// As [`Self::submit_stage`].
    pub fn submit_factory_stage(
        &self,
        caller: &Caller,
        code: &TraceabilityCode,
        input: FactoryInput,
    ) -> Result<StageReceipt, ProvenanceError> {
        self.submit_stage(caller, code, StageSubmission::Factory(input))
    }

    /// # Errors
    /// As [`Self::submit_stage`].
    pub fn submit_driver_stage(
        &self,
        caller: &Caller,
        code: &TraceabilityCode,
        input: DriverInput,
    ) -> Result<StageReceipt, ProvenanceError> {
        self.submit_stage(caller, code, StageSubmission::Driver(input))
    }

    /// # Errors
    /// As [`Self::submit_stage`].
    pub fn submit_shop_stage(
        &self,
        caller: &Caller,
        code: &TraceabilityCode,
        input: ShopInput,
    ) -> Result<StageReceipt, ProvenanceError> {
        self.submit_stage(caller, code, StageSubmission::Shop(input))
    }

    /// Validate and commit one stage sub-record together with the caller's
    /// back-link. Either both land or neither does.
    ///
    /// # Errors
    /// - [`ProvenanceError::UnauthorizedRole`] when the caller's role does not own the stage.
    /// - [`ProvenanceError::Validation`] for missing fields or malformed hashes.
    /// - [`ProvenanceError::DuplicateCode`], [`ProvenanceError::NotFound`] or
    ///   [`ProvenanceError::InvalidTransition`] from the state machine.
    /// - [`ProvenanceError::NotFound`] when the caller is not a registered user.
    /// - [`ProvenanceError::Conflict`] when a concurrent writer committed first.
    pub fn submit_stage(
        &self,
        caller: &Caller,
        code: &TraceabilityCode,
        submission: StageSubmission,
    ) -> Result<StageReceipt, ProvenanceError> {
        let stage = submission.stage();
        let store = RecordStore::new(&self.substrate);
        let current = store.load(code)?;
        let minted = current.is_some() || store.was_minted(code)?;
        self.validator.validate(
            caller,
            code,
            &submission,
            current.as_ref().map(|(fruit, _)| fruit),
            minted,
        )?;

        let ctx = self.substrate.begin()?;
        let (mut fruit, observed) = match current {
            Some((fruit, version)) => (fruit, Some(version)),
            None => (Fruit::new(code.clone()), None),
        };
        fruit.attach(submission, &ctx);
        let mut write_set = WriteSet::new();
        store.stage_put(&mut write_set, &fruit, observed)?;
        UserRegistry::new(&self.substrate).stage_link(&mut write_set, &caller.user_id, code)?;

        let meta = self.commit(ctx, write_set)?;
        let state = self.validator.advance(stage);
        info!(
            code = %code,
            stage = %stage,
            state = %state,
            user_id = %caller.user_id,
            tx_id = %meta.tx_id,
            "stage committed"
        );
        Ok(StageReceipt {
            traceability_code: code.clone(),
            stage,
            state,
            tx_id: meta.tx_id,
            timestamp: meta.timestamp,
        })
    }

    /// # Errors
    /// Returns [`ProvenanceError::NotFound`] when the code is absent or tombstoned.
    pub fn get_fruit(&self, code: &TraceabilityCode) -> Result<Fruit, ProvenanceError> {
        RecordStore::new(&self.substrate).get(code)
    }

    /// Lazy, restartable history from the earliest commit to the latest.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::NotFound`] when the code was never created.
    pub fn get_fruit_history(
        &self,
        code: &TraceabilityCode,
    ) -> Result<HistoryIter<'_, L>, ProvenanceError> {
        HistoryReconstructor::new(&self.substrate).history(code)
    }

    /// # Errors
    /// As [`Self::get_fruit_history`], plus snapshot decoding errors.
    pub fn collect_fruit_history(
        &self,
        code: &TraceabilityCode,
    ) -> Result<Vec<HistoryQueryResult>, ProvenanceError> {
        HistoryReconstructor::new(&self.substrate).collect(code)
    }

    /// # Errors
    /// Returns [`ProvenanceError::NotFound`] for an unregistered user.
    pub fn get_user_fruits(&self, user_id: &UserId) -> Result<Vec<TraceabilityCode>, ProvenanceError> {
        UserRegistry::new(&self.substrate).list_fruits(user_id)
    }

    /// # Errors
    /// Returns [`ProvenanceError::NotFound`] for an unregistered user.
    pub fn get_user(&self, user_id: &UserId) -> Result<User, ProvenanceError> {
        UserRegistry::new(&self.substrate).get(user_id)
    }

    /// # Errors
    /// [`ProvenanceError::NotFound`] for an unknown code, [`ProvenanceError::Tampered`]
    /// when the log fails verification.
    pub fn verify_history(
        &self,
        code: &TraceabilityCode,
    ) -> Result<HistoryVerification, ProvenanceError> {
        HistoryReconstructor::new(&self.substrate).verify(code)
    }

    /// Administrative correction: record a deletion entry for `code`. The code
    /// stays reserved and its history stays readable.
    ///
    /// # Errors
    /// [`ProvenanceError::NotFound`] when the code is not live, or
    /// [`ProvenanceError::Conflict`] when it changed concurrently.
    pub fn tombstone_fruit(&self, code: &TraceabilityCode) -> Result<CommitMeta, ProvenanceError> {
        let store = RecordStore::new(&self.substrate);
        let Some((_, version)) = store.load(code)? else {
            return Err(ProvenanceError::NotFound { key: LedgerKey::fruit(code).to_string() });
        };
        let ctx = self.substrate.begin()?;
        let mut write_set = WriteSet::new();
        store.stage_delete(&mut write_set, code, version);
        let meta = self.commit(ctx, write_set)?;
        warn!(code = %code, tx_id = %meta.tx_id, "fruit tombstoned");
        Ok(meta)
    }

    fn commit(&self, ctx: TxContext, write_set: WriteSet) -> Result<CommitMeta, ProvenanceError> {
        self.substrate.commit(ctx, write_set).map_err(|err| {
            if let ProvenanceError::Conflict { key } = &err {
                warn!(key = %key, tx_id = %ctx.tx_id, "commit lost a write race");
            }
            err
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;

    use proptest::prelude::*;

    use super::*;
    use crate::fixtures::*;
    use crate::substrate::{LogEntry, MemoryLedger, VersionedValue};

    fn ledger_with_participants() -> Result<ProvenanceLedger<MemoryLedger>, ProvenanceError> {
        let ledger = ProvenanceLedger::new(MemoryLedger::new());
        for (id, user_type) in [
            ("p1", UserType::Producer),
            ("f1", UserType::Processor),
            ("d1", UserType::Carrier),
            ("s1", UserType::Retailer),
            ("c1", UserType::Consumer),
        ] {
            ledger.register_user(user_id(id), user_type, hash('e'))?;
        }
        Ok(ledger)
    }

    fn submission_for(stage: Stage) -> (Caller, StageSubmission) {
        match stage {
            Stage::Farmer => {
                (caller("p1", UserType::Producer), StageSubmission::Farmer(farmer_input()))
            }
            Stage::Factory => {
                (caller("f1", UserType::Processor), StageSubmission::Factory(factory_input()))
            }
            Stage::Driver => {
                (caller("d1", UserType::Carrier), StageSubmission::Driver(driver_input()))
            }
            Stage::Shop => (caller("s1", UserType::Retailer), StageSubmission::Shop(shop_input())),
        }
    }

    #[test]
    fn farmer_then_factory_scenario() -> Result<(), ProvenanceError> {
        let ledger = ledger_with_participants()?;
        let t001 = code("T-001");

        ledger.submit_farmer_stage(&caller("p1", UserType::Producer), &t001, farmer_input())?;
        let fruit = ledger.get_fruit(&t001)?;
        assert_eq!(fruit.state, StageState::FarmerSet);
        assert!(fruit.farmer_input.is_some());
        assert!(fruit.factory_input.is_none());
        assert!(fruit.driver_input.is_none());
        assert!(fruit.shop_input.is_none());

        let driver = ledger.submit_driver_stage(&caller("d1", UserType::Carrier), &t001, driver_input());
        assert_eq!(
            driver,
            Err(ProvenanceError::InvalidTransition {
                stage: Stage::Driver,
                expected: StageState::FactorySet,
                actual: StageState::FarmerSet,
            })
        );

        let receipt =
            ledger.submit_factory_stage(&caller("f1", UserType::Processor), &t001, factory_input())?;
        assert_eq!(receipt.state, StageState::FactorySet);

        let history = ledger.collect_fruit_history(&t001)?;
        assert_eq!(history.len(), 2);
        assert_ne!(history[0].tx_id, history[1].tx_id);
        assert!(history[0].timestamp <= history[1].timestamp);
        assert_eq!(history[1].tx_id, receipt.tx_id);
        assert!(history.iter().all(|entry| !entry.is_delete));
        Ok(())
    }

    #[test]
    fn stage_records_are_stamped_by_the_substrate() -> Result<(), ProvenanceError> {
        let ledger = ledger_with_participants()?;
        let receipt =
            ledger.submit_farmer_stage(&caller("p1", UserType::Producer), &code("T-001"), farmer_input())?;
        let fruit = ledger.get_fruit(&code("T-001"))?;
        assert_eq!(fruit.stage_stamp(Stage::Farmer), Some((receipt.tx_id, receipt.timestamp)));
        Ok(())
    }

    #[test]
    fn resubmitting_a_stage_is_rejected_and_leaves_it_unchanged() -> Result<(), ProvenanceError> {
        let ledger = ledger_with_participants()?;
        let t001 = code("T-001");
        ledger.submit_farmer_stage(&caller("p1", UserType::Producer), &t001, farmer_input())?;
        ledger.submit_factory_stage(&caller("f1", UserType::Processor), &t001, factory_input())?;
        let before = ledger.get_fruit(&t001)?;

        let mut changed = factory_input();
        changed.factory_name = "Other Packing Co.".to_string();
        let again = ledger.submit_factory_stage(&caller("f1", UserType::Processor), &t001, changed);
        assert!(matches!(again, Err(ProvenanceError::InvalidTransition { .. })));

        let replant = ledger.submit_farmer_stage(&caller("p1", UserType::Producer), &t001, farmer_input());
        assert_eq!(replant, Err(ProvenanceError::DuplicateCode { code: "T-001".to_string() }));

        assert_eq!(ledger.get_fruit(&t001)?, before);
        assert_eq!(ledger.collect_fruit_history(&t001)?.len(), 2);
        Ok(())
    }

    #[test]
    fn wrong_role_fails_before_any_write() -> Result<(), ProvenanceError> {
        let ledger = ledger_with_participants()?;
        let result =
            ledger.submit_farmer_stage(&caller("c1", UserType::Consumer), &code("T-001"), farmer_input());
        assert_eq!(
            result,
            Err(ProvenanceError::UnauthorizedRole {
                stage: Stage::Farmer,
                required: UserType::Producer,
                actual: UserType::Consumer,
            })
        );
        assert!(matches!(ledger.get_fruit_history(&code("T-001")), Err(ProvenanceError::NotFound { .. })));
        assert!(ledger.get_user_fruits(&user_id("c1"))?.is_empty());
        Ok(())
    }

    #[test]
    fn role_is_reported_ahead_of_missing_record() -> Result<(), ProvenanceError> {
        let ledger = ledger_with_participants()?;
        let result = ledger.submit_factory_stage(
            &caller("c1", UserType::Consumer),
            &code("T-404"),
            factory_input(),
        );
        assert_eq!(
            result,
            Err(ProvenanceError::UnauthorizedRole {
                stage: Stage::Factory,
                required: UserType::Processor,
                actual: UserType::Consumer,
            })
        );

        let mut blank = factory_input();
        blank.factory_name = String::new();
        let result =
            ledger.submit_factory_stage(&caller("d1", UserType::Carrier), &code("T-404"), blank);
        assert!(matches!(result, Err(ProvenanceError::UnauthorizedRole { .. })));
        Ok(())
    }

    #[test]
    fn unregistered_caller_writes_neither_record_nor_link() -> Result<(), ProvenanceError> {
        let ledger = ledger_with_participants()?;
        let result =
            ledger.submit_farmer_stage(&caller("p9", UserType::Producer), &code("T-001"), farmer_input());
        assert_eq!(result, Err(ProvenanceError::NotFound { key: "user:p9".to_string() }));
        assert!(matches!(ledger.get_fruit(&code("T-001")), Err(ProvenanceError::NotFound { .. })));
        assert!(!ledger.substrate().has_history(&LedgerKey::fruit(&code("T-001")))?);
        Ok(())
    }

    #[test]
    fn every_participant_is_linked_once() -> Result<(), ProvenanceError> {
        let ledger = ledger_with_participants()?;
        for value in ["T-001", "T-002"] {
            for stage in Stage::ALL {
                let (who, submission) = submission_for(stage);
                ledger.submit_stage(&who, &code(value), submission)?;
            }
        }
        for id in ["p1", "f1", "d1", "s1"] {
            assert_eq!(ledger.get_user_fruits(&user_id(id))?, vec![code("T-001"), code("T-002")]);
        }
        assert_eq!(ledger.get_user(&user_id("s1"))?.user_type, UserType::Retailer);
        assert_eq!(ledger.get_fruit(&code("T-002"))?.state, StageState::ShopSet);
        assert_eq!(ledger.verify_history(&code("T-002"))?.entries, 4);
        Ok(())
    }

    #[test]
    fn later_stage_for_unknown_code_is_not_found() -> Result<(), ProvenanceError> {
        let ledger = ledger_with_participants()?;
        let result =
            ledger.submit_factory_stage(&caller("f1", UserType::Processor), &code("T-404"), factory_input());
        assert_eq!(result, Err(ProvenanceError::NotFound { key: "fruit:T-404".to_string() }));
        Ok(())
    }

    #[test]
    fn tombstone_hides_record_but_keeps_history_and_reserves_code() -> Result<(), ProvenanceError> {
        let ledger = ledger_with_participants()?;
        let t001 = code("T-001");
        ledger.submit_farmer_stage(&caller("p1", UserType::Producer), &t001, farmer_input())?;
        ledger.tombstone_fruit(&t001)?;

        assert!(matches!(ledger.get_fruit(&t001), Err(ProvenanceError::NotFound { .. })));
        let history = ledger.collect_fruit_history(&t001)?;
        assert_eq!(history.len(), 2);
        assert!(history[1].is_delete);
        assert!(history[1].record.is_none());
        assert_eq!(ledger.verify_history(&t001)?.entries, 2);

        let remint = ledger.submit_farmer_stage(&caller("p1", UserType::Producer), &t001, farmer_input());
        assert_eq!(remint, Err(ProvenanceError::DuplicateCode { code: "T-001".to_string() }));
        let factory =
            ledger.submit_factory_stage(&caller("f1", UserType::Processor), &t001, factory_input());
        assert!(matches!(factory, Err(ProvenanceError::NotFound { .. })));
        assert!(matches!(ledger.tombstone_fruit(&t001), Err(ProvenanceError::NotFound { .. })));
        Ok(())
    }

    #[test]
    fn concurrent_writers_to_one_stage_have_a_single_winner() -> Result<(), ProvenanceError> {
        let ledger = Arc::new(ProvenanceLedger::new(Arc::new(MemoryLedger::new())));
        ledger.register_user(user_id("p1"), UserType::Producer, hash('e'))?;
        let writers = 8;
        for index in 0..writers {
            ledger.register_user(user_id(&format!("f{index}")), UserType::Processor, hash('e'))?;
        }
        ledger.submit_farmer_stage(&caller("p1", UserType::Producer), &code("T-001"), farmer_input())?;

        let barrier = Arc::new(Barrier::new(writers));
        let handles = (0..writers)
            .map(|index| {
                let ledger = Arc::clone(&ledger);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let who = caller(&format!("f{index}"), UserType::Processor);
                    barrier.wait();
                    ledger.submit_factory_stage(&who, &code("T-001"), factory_input())
                })
            })
            .collect::<Vec<_>>();

        let mut winners = 0;
        for handle in handles {
            match handle.join() {
                Ok(Ok(_)) => winners += 1,
                Ok(Err(ProvenanceError::Conflict { .. } | ProvenanceError::InvalidTransition { .. })) => {}
                Ok(Err(err)) => panic!("unexpected error: {err}"),
                Err(_) => panic!("writer thread panicked"),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(ledger.collect_fruit_history(&code("T-001"))?.len(), 2);

        let linked = (0..writers)
            .filter(|index| {
                ledger
                    .get_user_fruits(&user_id(&format!("f{index}")))
                    .is_ok_and(|codes| codes.contains(&code("T-001")))
            })
            .count();
        assert_eq!(linked, 1);
        Ok(())
    }

    /// Substrate that rewrites the first committed value when the log is read.
    struct ForgingLedger {
        inner: MemoryLedger,
    }

    impl LedgerSubstrate for ForgingLedger {
        fn begin(&self) -> Result<TxContext, ProvenanceError> {
            self.inner.begin()
        }

        fn read(&self, key: &LedgerKey) -> Result<Option<VersionedValue>, ProvenanceError> {
            self.inner.read(key)
        }

        fn commit(&self, ctx: TxContext, write_set: WriteSet) -> Result<CommitMeta, ProvenanceError> {
            self.inner.commit(ctx, write_set)
        }

        fn log_entries(
            &self,
            key: &LedgerKey,
            after_sequence: Option<u64>,
            limit: usize,
        ) -> Result<Vec<LogEntry>, ProvenanceError> {
            let mut entries = self.inner.log_entries(key, after_sequence, limit)?;
            for entry in &mut entries {
                if let Some(value) = entry.value.as_mut() {
                    let text = String::from_utf8_lossy(value).replace("Ganzhou", "Valencia");
                    *value = text.into_bytes();
                }
            }
            Ok(entries)
        }
    }

    #[test]
    fn verify_history_detects_forged_log() -> Result<(), ProvenanceError> {
        let ledger = ProvenanceLedger::new(ForgingLedger { inner: MemoryLedger::new() });
        ledger.register_user(user_id("p1"), UserType::Producer, hash('e'))?;
        ledger.submit_farmer_stage(&caller("p1", UserType::Producer), &code("T-001"), farmer_input())?;

        let result = ledger.verify_history(&code("T-001"));
        assert!(matches!(result, Err(ProvenanceError::Tampered { sequence: _, .. })));
        Ok(())
    }

    fn stage_strategy() -> impl Strategy<Value = Stage> {
        prop_oneof![
            Just(Stage::Farmer),
            Just(Stage::Factory),
            Just(Stage::Driver),
            Just(Stage::Shop)
        ]
    }

    proptest! {
        #[test]
        fn property_stages_are_accepted_only_in_order(stages in proptest::collection::vec(stage_strategy(), 1..12)) {
            let ledger = ledger_with_participants();
            prop_assert!(ledger.is_ok());
            let ledger = ledger.unwrap_or_else(|_| unreachable!());
            let t001 = code("T-001");
            let mut accepted = Vec::new();
            let mut accepted_tx = Vec::new();

            for stage in stages {
                let (who, submission) = submission_for(stage);
                let expected_next = ledger
                    .get_fruit(&t001)
                    .map_or(Some(Stage::Farmer), |fruit| fruit.state.next_stage());
                match ledger.submit_stage(&who, &t001, submission) {
                    Ok(receipt) => {
                        prop_assert_eq!(Some(stage), expected_next);
                        accepted.push(stage);
                        accepted_tx.push(receipt.tx_id);
                    }
                    Err(err) => {
                        prop_assert_ne!(Some(stage), expected_next);
                        let rejected_by_state_machine = matches!(
                            err,
                            ProvenanceError::InvalidTransition { .. }
                                | ProvenanceError::DuplicateCode { .. }
                                | ProvenanceError::NotFound { .. }
                        );
                        prop_assert!(rejected_by_state_machine, "unexpected error: {}", err);
                    }
                }
            }

            prop_assert_eq!(&accepted[..], &Stage::ALL[..accepted.len()]);
            match ledger.collect_fruit_history(&t001) {
                Ok(history) => {
                    let replayed = history.iter().map(|entry| entry.tx_id).collect::<Vec<_>>();
                    prop_assert_eq!(replayed, accepted_tx);
                    prop_assert!(history.windows(2).all(|pair| pair[0].timestamp <= pair[1].timestamp));
                    prop_assert!(ledger.verify_history(&t001).is_ok());
                }
                Err(err) => {
                    prop_assert!(accepted.is_empty());
                    prop_assert!(
                        matches!(err, ProvenanceError::NotFound { .. }),
                        "unexpected history error: {}",
                        err
                    );
                }
            }
        }
    }
}
