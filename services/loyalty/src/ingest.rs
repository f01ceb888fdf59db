use crate::error::{Entity, Field, IngestError};
use crate::filename::derive_file_name;
use crate::loyalty;
use crate::object_store::{DocumentStore, StoreError};
use crate::repository::{Ledger, NewResult};
use crate::roles::Role;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// The only media type accepted for result documents.
pub const PDF_MEDIA_TYPE: &str = "application/pdf";

/// A pending test-result upload
#[derive(Debug, Clone)]
pub struct IngestInput {
    pub member_id: Uuid,
    pub test_type_id: Uuid,
    /// Monetary cost of the test; converted into points by the member's tier
    pub cost: f64,
    pub notes: Option<String>,
    /// When the test occurred; also the date component of the derived key
    pub occurred_at: DateTime<Utc>,
    /// Raw document bytes
    pub document: Vec<u8>,
    /// Media type claimed by the caller; must be PDF
    pub media_type: String,
}

/// Outcome of a fully committed ingestion
#[derive(Debug, Clone, Copy, Serialize)]
pub struct IngestOutcome {
    pub fact_id: Uuid,
    pub points_added: f64,
    pub new_points_total: f64,
    pub tier_upgraded: bool,
}

/// Coordinates the object store and the ledger for test-result ingestion.
///
/// The two stores share no transaction boundary, so the pipeline runs as a
/// saga: upload first, then bookkeeping as one atomic relational unit, and a
/// compensating delete of the uploaded document when bookkeeping fails. The
/// forward order makes the compensation cheap (delete by known key), and the
/// caller always observes either a fully committed result or a clean failure
/// with no surviving object.
pub struct TestIngestor {
    store: Arc<dyn DocumentStore>,
    ledger: Arc<dyn Ledger>,
}

impl TestIngestor {
    pub fn new(store: Arc<dyn DocumentStore>, ledger: Arc<dyn Ledger>) -> Self {
        Self { store, ledger }
    }

    /// Ingest one test result for a member.
    ///
    /// Preconditions are checked before any mutation; validation failures
    /// never reach either store. Errors from the bookkeeping step are
    /// returned only after the compensating delete has been attempted.
    #[instrument(
        skip(self, input),
        fields(member_id = %input.member_id, type_id = %input.test_type_id)
    )]
    pub async fn ingest(
        &self,
        role: Role,
        input: IngestInput,
    ) -> Result<IngestOutcome, IngestError> {
        if !role.has_role(Role::Admin) {
            return Err(IngestError::Unauthorized);
        }

        if input.media_type != PDF_MEDIA_TYPE {
            return Err(IngestError::InvalidInput(Field::MediaType));
        }

        if !input.cost.is_finite() || input.cost < 0.0 {
            return Err(IngestError::InvalidInput(Field::Cost));
        }

        let member = self
            .ledger
            .get_member(input.member_id)
            .await
            .map_err(IngestError::Bookkeeping)?
            .ok_or(IngestError::NotFound(Entity::Member))?;

        let test_type = self
            .ledger
            .get_test_type(input.test_type_id)
            .await
            .map_err(IngestError::Bookkeeping)?
            .ok_or(IngestError::NotFound(Entity::TestType))?;

        // A dangling tier reference behaves like an unassigned tier: the
        // grant degenerates to zero rather than failing the ingestion.
        let tier = match member.tier_id {
            Some(tier_id) => self
                .ledger
                .get_tier(tier_id)
                .await
                .map_err(IngestError::Bookkeeping)?,
            None => None,
        };

        let file_name = derive_file_name(&member.name, &test_type.title, input.occurred_at);

        let file_path = self
            .store
            .put(&file_name, input.document, PDF_MEDIA_TYPE)
            .await
            .map_err(|err| match err {
                StoreError::AlreadyExists => IngestError::UploadConflict,
                StoreError::Other(err) => IngestError::Storage(err),
            })?;

        let outcome = loyalty::apply_points(member.points, tier.as_ref(), input.cost);

        let fact = NewResult {
            user_id: input.member_id,
            type_id: input.test_type_id,
            cost: input.cost,
            file_path: file_path.clone(),
            notes: input.notes.clone(),
            created_at: input.occurred_at,
        };

        match self.ledger.record_result(fact, outcome.points_added).await {
            Ok(recorded) => {
                metrics::counter!("loyalty.results.ingested").increment(1);
                metrics::histogram!("loyalty.points.granted").record(outcome.points_added);

                info!(
                    fact_id = %recorded.fact_id,
                    file_path = %file_path,
                    points_added = outcome.points_added,
                    tier_upgraded = recorded.tier_upgraded,
                    "Test result ingested"
                );

                Ok(IngestOutcome {
                    fact_id: recorded.fact_id,
                    points_added: outcome.points_added,
                    new_points_total: recorded.new_points_total,
                    tier_upgraded: recorded.tier_upgraded,
                })
            }
            Err(err) => {
                // The uploaded document must not outlive a failed bookkeeping
                // write. The delete's own failure is logged with its cause
                // and a dedicated counter; the caller still sees the
                // bookkeeping error.
                if let Err(cleanup_err) = self.store.remove(std::slice::from_ref(&file_path)).await
                {
                    error!(
                        error = %cleanup_err,
                        file_path = %file_path,
                        "Compensating delete failed; document may be orphaned"
                    );
                    metrics::counter!("loyalty.ingest.compensation_failures").increment(1);
                } else {
                    info!(
                        file_path = %file_path,
                        "Compensating delete removed uploaded document"
                    );
                }

                metrics::counter!("loyalty.results.failed").increment(1);
                Err(IngestError::Bookkeeping(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{
        FactRollup, Member, MemberRollup, RecordedResult, ResultPage, ResultQuery,
        TestResultRecord, TestType, TierDefinition,
    };
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemStore {
        objects: Mutex<HashMap<String, Vec<u8>>>,
        fail_removes: AtomicBool,
        puts: AtomicUsize,
    }

    #[async_trait]
    impl DocumentStore for MemStore {
        async fn put(
            &self,
            key: &str,
            bytes: Vec<u8>,
            _content_type: &str,
        ) -> Result<String, StoreError> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            let mut objects = self.objects.lock().unwrap();
            if objects.contains_key(key) {
                return Err(StoreError::AlreadyExists);
            }
            objects.insert(key.to_string(), bytes);
            Ok(key.to_string())
        }

        async fn remove(&self, keys: &[String]) -> anyhow::Result<()> {
            if self.fail_removes.load(Ordering::SeqCst) {
                anyhow::bail!("object store unavailable");
            }
            let mut objects = self.objects.lock().unwrap();
            for key in keys {
                objects.remove(key);
            }
            Ok(())
        }

        async fn exists(&self, key: &str) -> anyhow::Result<bool> {
            Ok(self.objects.lock().unwrap().contains_key(key))
        }
    }

    struct MemLedger {
        members: Mutex<HashMap<Uuid, Member>>,
        types: HashMap<Uuid, TestType>,
        tiers: Vec<TierDefinition>,
        facts: Mutex<Vec<TestResultRecord>>,
        fail_bookkeeping: AtomicBool,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl Ledger for MemLedger {
        async fn get_member(&self, id: Uuid) -> anyhow::Result<Option<Member>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.members.lock().unwrap().get(&id).cloned())
        }

        async fn get_test_type(&self, id: Uuid) -> anyhow::Result<Option<TestType>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.types.get(&id).cloned())
        }

        async fn get_tier(&self, id: i64) -> anyhow::Result<Option<TierDefinition>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.tiers.iter().find(|t| t.id == id).cloned())
        }

        async fn record_result(
            &self,
            fact: NewResult,
            points_added: f64,
        ) -> anyhow::Result<RecordedResult> {
            if self.fail_bookkeeping.load(Ordering::SeqCst) {
                return Err(anyhow!("relational store down"));
            }

            let fact_id = Uuid::new_v4();
            let (new_points_total, tier_upgraded) = {
                let mut members = self.members.lock().unwrap();
                let member = members
                    .get_mut(&fact.user_id)
                    .ok_or_else(|| anyhow!("member disappeared"))?;
                member.points += points_added;

                let tier_upgraded =
                    match loyalty::advance_tier(&self.tiers, member.tier_id, member.points) {
                        Some(tier_id) => {
                            member.tier_id = Some(tier_id);
                            true
                        }
                        None => false,
                    };

                (member.points, tier_upgraded)
            };

            self.facts.lock().unwrap().push(TestResultRecord {
                id: fact_id,
                user_id: fact.user_id,
                type_id: fact.type_id,
                cost: fact.cost,
                file_path: fact.file_path,
                notes: fact.notes,
                created_at: fact.created_at,
            });

            Ok(RecordedResult {
                fact_id,
                new_points_total,
                tier_upgraded,
            })
        }

        async fn list_results(&self, _query: &ResultQuery) -> anyhow::Result<ResultPage> {
            let results = self.facts.lock().unwrap().clone();
            let total_count = results.len() as i64;
            Ok(ResultPage {
                results,
                total_count,
                page: 1,
                total_pages: (total_count > 0) as i64,
            })
        }

        async fn member_rollups(&self) -> anyhow::Result<Vec<MemberRollup>> {
            Ok(self
                .members
                .lock()
                .unwrap()
                .values()
                .map(|m| MemberRollup {
                    id: m.id,
                    points: m.points,
                    tier_id: m.tier_id,
                })
                .collect())
        }

        async fn tiers(&self) -> anyhow::Result<Vec<TierDefinition>> {
            Ok(self.tiers.clone())
        }

        async fn fact_rollups(&self) -> anyhow::Result<Vec<FactRollup>> {
            Ok(self
                .facts
                .lock()
                .unwrap()
                .iter()
                .map(|f| FactRollup {
                    type_id: f.type_id,
                    cost: f.cost,
                    created_at: f.created_at,
                })
                .collect())
        }

        async fn test_types(&self) -> anyhow::Result<Vec<TestType>> {
            Ok(self.types.values().cloned().collect())
        }

        async fn ping(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<MemStore>,
        ledger: Arc<MemLedger>,
        ingestor: TestIngestor,
        member_id: Uuid,
        type_id: Uuid,
    }

    fn ladder() -> Vec<TierDefinition> {
        let tier = |id: i64, pcr: f64, min_points: f64| TierDefinition {
            id,
            title: format!("tier-{id}"),
            description: String::new(),
            pcr,
            rcr: 0.0,
            min_points,
        };
        vec![
            tier(1, 10.0, 0.0),
            tier(2, 8.0, 100.0),
            tier(3, 5.0, 1000.0),
        ]
    }

    fn fixture(points: f64, tier_id: Option<i64>) -> Fixture {
        let member_id = Uuid::new_v4();
        let type_id = Uuid::new_v4();

        let member = Member {
            id: member_id,
            name: "Jane Doe".to_string(),
            phone: "555-0100".to_string(),
            age: Some(34),
            points,
            tier_id,
        };

        let ledger = Arc::new(MemLedger {
            members: Mutex::new(HashMap::from([(member_id, member)])),
            types: HashMap::from([(
                type_id,
                TestType {
                    id: type_id,
                    title: "Blood Panel".to_string(),
                },
            )]),
            tiers: ladder(),
            facts: Mutex::new(Vec::new()),
            fail_bookkeeping: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
        });

        let store = Arc::new(MemStore::default());
        let ingestor = TestIngestor::new(store.clone(), ledger.clone());

        Fixture {
            store,
            ledger,
            ingestor,
            member_id,
            type_id,
        }
    }

    fn input_for(fx: &Fixture) -> IngestInput {
        IngestInput {
            member_id: fx.member_id,
            test_type_id: fx.type_id,
            cost: 100.0,
            notes: None,
            occurred_at: Utc::now(),
            document: b"%PDF-1.4 test".to_vec(),
            media_type: PDF_MEDIA_TYPE.to_string(),
        }
    }

    #[tokio::test]
    async fn test_success_commits_document_and_fact() {
        let fx = fixture(0.0, Some(1));

        let outcome = fx
            .ingestor
            .ingest(Role::Admin, input_for(&fx))
            .await
            .unwrap();

        // Example conversion: cost 100 at pcr 10 grants 10 points.
        assert_eq!(outcome.points_added, 10.0);
        assert_eq!(outcome.new_points_total, 10.0);
        assert!(!outcome.tier_upgraded);

        let facts = fx.ledger.facts.lock().unwrap().clone();
        assert_eq!(facts.len(), 1);
        assert!(fx.store.exists(&facts[0].file_path).await.unwrap());
    }

    #[tokio::test]
    async fn test_unauthorized_performs_no_io() {
        let fx = fixture(0.0, Some(1));

        let err = fx
            .ingestor
            .ingest(Role::User, input_for(&fx))
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::Unauthorized));
        assert_eq!(fx.store.puts.load(Ordering::SeqCst), 0);
        assert_eq!(fx.ledger.reads.load(Ordering::SeqCst), 0);
        assert!(fx.ledger.facts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_non_pdf_before_any_call() {
        let fx = fixture(0.0, Some(1));
        let mut input = input_for(&fx);
        input.media_type = "image/png".to_string();

        let err = fx.ingestor.ingest(Role::Admin, input).await.unwrap_err();

        assert!(matches!(err, IngestError::InvalidInput(Field::MediaType)));
        assert_eq!(fx.store.puts.load(Ordering::SeqCst), 0);
        assert_eq!(fx.ledger.reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rejects_invalid_cost() {
        let fx = fixture(0.0, Some(1));

        for bad in [-1.0, f64::NAN, f64::INFINITY] {
            let mut input = input_for(&fx);
            input.cost = bad;
            let err = fx.ingestor.ingest(Role::Admin, input).await.unwrap_err();
            assert!(matches!(err, IngestError::InvalidInput(Field::Cost)));
        }

        assert_eq!(fx.store.puts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_member_and_type() {
        let fx = fixture(0.0, Some(1));

        let mut input = input_for(&fx);
        input.member_id = Uuid::new_v4();
        let err = fx.ingestor.ingest(Role::Admin, input).await.unwrap_err();
        assert!(matches!(err, IngestError::NotFound(Entity::Member)));

        let mut input = input_for(&fx);
        input.test_type_id = Uuid::new_v4();
        let err = fx.ingestor.ingest(Role::Admin, input).await.unwrap_err();
        assert!(matches!(err, IngestError::NotFound(Entity::TestType)));

        assert_eq!(fx.store.puts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_degenerate_rate_leaves_points_unchanged() {
        // No tier assigned at all.
        let fx = fixture(50.0, None);
        let outcome = fx
            .ingestor
            .ingest(Role::Admin, input_for(&fx))
            .await
            .unwrap();
        assert_eq!(outcome.points_added, 0.0);

        // Tier reference that resolves to nothing behaves the same.
        let fx = fixture(50.0, Some(99));
        let outcome = fx
            .ingestor
            .ingest(Role::Admin, input_for(&fx))
            .await
            .unwrap();
        assert_eq!(outcome.points_added, 0.0);
        assert_eq!(outcome.new_points_total, 50.0);

        // The fact itself is still committed.
        assert_eq!(fx.ledger.facts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bookkeeping_failure_compensates_upload() {
        let fx = fixture(0.0, Some(1));
        fx.ledger.fail_bookkeeping.store(true, Ordering::SeqCst);

        let err = fx
            .ingestor
            .ingest(Role::Admin, input_for(&fx))
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::Bookkeeping(_)));
        assert!(fx.store.objects.lock().unwrap().is_empty());
        assert!(fx.ledger.facts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_compensation_failure_does_not_mask_original_error() {
        let fx = fixture(0.0, Some(1));
        fx.ledger.fail_bookkeeping.store(true, Ordering::SeqCst);
        fx.store.fail_removes.store(true, Ordering::SeqCst);

        let err = fx
            .ingestor
            .ingest(Role::Admin, input_for(&fx))
            .await
            .unwrap_err();

        // The caller sees the bookkeeping failure, not the delete failure.
        assert!(matches!(err, IngestError::Bookkeeping(_)));
        // The orphaned object is the logged-and-counted case.
        assert_eq!(fx.store.objects.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_repeat_ingestion_conflicts_and_preserves_first() {
        let fx = fixture(0.0, Some(1));
        let occurred_at = Utc::now();

        let mut first = input_for(&fx);
        first.occurred_at = occurred_at;
        let outcome = fx.ingestor.ingest(Role::Admin, first).await.unwrap();

        let mut second = input_for(&fx);
        second.occurred_at = occurred_at;
        let err = fx.ingestor.ingest(Role::Admin, second).await.unwrap_err();

        assert!(matches!(err, IngestError::UploadConflict));

        // First call's object and fact are untouched, points granted once.
        let facts = fx.ledger.facts.lock().unwrap().clone();
        assert_eq!(facts.len(), 1);
        assert!(fx.store.exists(&facts[0].file_path).await.unwrap());
        let members = fx.ledger.members.lock().unwrap();
        assert_eq!(members[&fx.member_id].points, outcome.new_points_total);
    }

    #[tokio::test]
    async fn test_tier_upgrade_when_threshold_crossed() {
        let fx = fixture(95.0, Some(1));

        let outcome = fx
            .ingestor
            .ingest(Role::Admin, input_for(&fx))
            .await
            .unwrap();

        assert_eq!(outcome.new_points_total, 105.0);
        assert!(outcome.tier_upgraded);

        let members = fx.ledger.members.lock().unwrap();
        assert_eq!(members[&fx.member_id].tier_id, Some(2));
    }

    #[tokio::test]
    async fn test_pipeline_never_demotes() {
        // Member already on the top tier with a balance below its threshold.
        let fx = fixture(0.0, Some(3));

        let outcome = fx
            .ingestor
            .ingest(Role::Admin, input_for(&fx))
            .await
            .unwrap();

        assert!(!outcome.tier_upgraded);
        let members = fx.ledger.members.lock().unwrap();
        assert_eq!(members[&fx.member_id].tier_id, Some(3));
    }
}
