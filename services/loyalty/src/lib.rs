//! Loyalty Test-Result Service
//!
//! Administrative backend for the member testing program: staff upload
//! test-result documents, the service files them in object storage, records
//! the fact in PostgreSQL and converts the test's cost into loyalty points
//! that can promote the member to a higher tier.
//!
//! ## Features
//!
//! - **Atomic Ingestion**: the document upload and the relational
//!   bookkeeping (fact row, points grant, tier promotion) commit as a saga
//!   with a compensating delete, so a failed call leaves no orphaned object
//!   and no dangling fact
//! - **Loyalty Accounting**: pure points conversion from cost and tier
//!   conversion rate, with monotonic threshold-based tier promotion
//! - **Dashboard Statistics**: in-memory safe joins over independently
//!   fetched collections, degrading per section instead of failing
//!
//! ## Architecture
//!
//! ```text
//! Admin API (axum)             S3 Bucket                 PostgreSQL
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────┐
//! │ POST         │           │ results/     │          │ member       │
//! │ /api/v1/     │──────────▶│   {name}_    │          │ tier         │
//! │ results      │           │   {type}_    │          │ test_type    │
//! └──────────────┘           │   {date}.pdf │          │ test_result  │
//!        │                   └──────────────┘          └──────────────┘
//!        ▼                          │                         ▲
//! ┌──────────────┐                  │                         │
//! │ Test         │──────────────────┴─────────────────────────┤
//! │ Ingestor     │   upload, then one bookkeeping transaction │
//! └──────────────┘   (compensating delete on failure)         │
//!        │                                                    │
//!        ▼                                                    │
//! ┌──────────────┐           ┌──────────────┐                │
//! │ Loyalty      │           │ Stats        │────────────────┘
//! │ Accountant   │           │ Aggregator   │
//! └──────────────┘           └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod filename;
pub mod ingest;
pub mod loyalty;
pub mod object_store;
pub mod repository;
pub mod roles;
pub mod stats;

pub use api::{start_api_server, AppState};
pub use config::Config;
pub use error::{Entity, ErrorResponse, Field, IngestError};
pub use filename::derive_file_name;
pub use ingest::{IngestInput, IngestOutcome, TestIngestor, PDF_MEDIA_TYPE};
pub use loyalty::{advance_tier, apply_points, PointsOutcome};
pub use object_store::{DocumentStore, S3DocumentStore, StoreError};
pub use repository::{
    FactRollup, Ledger, Member, MemberRollup, NewResult, PgLedger, RecordedResult, ResultPage,
    ResultQuery, TestResultRecord, TestType, TierDefinition,
};
pub use roles::Role;
pub use stats::{aggregate, CategoryCount, DashboardStats, StatsService};
