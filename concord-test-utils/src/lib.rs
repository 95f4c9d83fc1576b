//! Concord Test Utilities
//!
//! Shared test infrastructure for the concord workspace:
//! - Fixture entity types exercising every index kind
//! - Proptest generators for fixtures
//! - A storage wrapper that injects failures and latency
//! - Assertions on concord error kinds

// Re-export the in-memory backend from its source crate
pub use concord_storage::MemoryStorage;

// Re-export core types for convenience
pub use concord_core::{
    Entity, EntityDescriptor, EntityModel, FieldDef, FieldType, FieldValue, PersistConfig, PersistError,
    PersistResult, Record, SearchTerm, State,
};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use concord_core::StorageError;
use concord_storage::{Query, Storage, Transaction};

/// Install a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Convert a JSON object literal into a stored record.
///
/// # Panics
///
/// Panics if `value` is not an object.
pub fn record(value: serde_json::Value) -> Record {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("record fixtures must be JSON objects, got {other}"),
    }
}

// ============================================================================
// FAULT INJECTION
// ============================================================================

/// Wraps a [`MemoryStorage`], optionally delaying or failing row loads.
#[derive(Debug, Clone, Default)]
pub struct FlakyStorage {
    inner: MemoryStorage,
    fail_loads: Arc<AtomicBool>,
    load_delay_ms: Arc<AtomicU64>,
    loads: Arc<AtomicU64>,
}

impl FlakyStorage {
    pub fn new(inner: MemoryStorage) -> Self {
        Self {
            inner,
            ..Default::default()
        }
    }

    /// Make every subsequent `load_rows` fail (or succeed again).
    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Delay every subsequent `load_rows`.
    pub fn set_load_delay(&self, delay: Duration) {
        self.load_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of `load_rows` calls attempted, failed ones included.
    pub fn load_attempts(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn memory(&self) -> &MemoryStorage {
        &self.inner
    }
}

#[async_trait]
impl Storage for FlakyStorage {
    async fn begin(&self, read_only: bool) -> PersistResult<Box<dyn Transaction>> {
        Ok(Box::new(FlakyTransaction {
            inner: self.inner.begin(read_only).await?,
            storage: self.clone(),
        }))
    }
}

struct FlakyTransaction {
    inner: Box<dyn Transaction>,
    storage: FlakyStorage,
}

#[async_trait]
impl Transaction for FlakyTransaction {
    fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }

    async fn count_rows(&mut self, datasource: &str, entity: &str, query: &Query) -> PersistResult<u64> {
        self.inner.count_rows(datasource, entity, query).await
    }

    async fn create_row(
        &mut self,
        datasource: &str,
        entity: &str,
        primary_field: &str,
        record: Record,
    ) -> PersistResult<Record> {
        self.inner.create_row(datasource, entity, primary_field, record).await
    }

    async fn load_rows(&mut self, datasource: &str, entity: &str, query: &Query) -> PersistResult<Vec<Record>> {
        self.storage.loads.fetch_add(1, Ordering::SeqCst);
        let delay = self.storage.load_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.storage.fail_loads.load(Ordering::SeqCst) {
            return Err(StorageError::Backend {
                entity: entity.to_string(),
                operation: "load_rows".to_string(),
                reason: "injected failure".to_string(),
            }
            .into());
        }
        self.inner.load_rows(datasource, entity, query).await
    }

    async fn update_row(
        &mut self,
        datasource: &str,
        entity: &str,
        primary_field: &str,
        record: Record,
    ) -> PersistResult<()> {
        self.inner.update_row(datasource, entity, primary_field, record).await
    }

    async fn delete_rows(&mut self, datasource: &str, entity: &str, query: &Query) -> PersistResult<u64> {
        self.inner.delete_rows(datasource, entity, query).await
    }

    async fn commit(self: Box<Self>) -> PersistResult<()> {
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> PersistResult<()> {
        self.inner.rollback().await
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Fixture entity types and seeded storage.

    use super::*;
    use bigdecimal::BigDecimal;
    use concord_core::{EntityJoin, FnMapper, Measured, PersistEnum, Unit};
    use serde_json::json;
    use uuid::Uuid;

    /// Storage entity name of [`Server`].
    pub const SERVER_ENTITY: &str = "server";

    /// Storage entity name of [`Region`].
    pub const REGION_ENTITY: &str = "region";

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum ServerState {
        Pending,
        Running,
        Stopped,
    }

    impl PersistEnum for ServerState {
        const TYPE_NAME: &'static str = "ServerState";

        fn variants() -> &'static [&'static str] {
            &["PENDING", "RUNNING", "STOPPED"]
        }

        fn from_name(name: &str) -> Option<Self> {
            match name {
                "PENDING" => Some(Self::Pending),
                "RUNNING" => Some(Self::Running),
                "STOPPED" => Some(Self::Stopped),
                _ => None,
            }
        }

        fn name(&self) -> &'static str {
            match self {
                Self::Pending => "PENDING",
                Self::Running => "RUNNING",
                Self::Stopped => "STOPPED",
            }
        }
    }

    /// A compute server.
    ///
    /// Indexes: primary `serverId`; secondary `name` and `state`; foreign
    /// cascade `regionId` -> `regionId:zone` -> `regionId:zone:rack`
    /// identifying [`Region`]. Schema version 2; version 0 stored the name
    /// as `hostname` and version 1 stored the cpu count as `cpus`.
    #[derive(Debug, Clone, PartialEq)]
    pub struct Server {
        pub server_id: i64,
        pub name: String,
        pub region_id: String,
        pub zone: String,
        pub rack: Option<String>,
        pub state: ServerState,
        pub memory: Option<Measured>,
        pub cpu_count: i32,
        pub tags: Vec<String>,
        pub hourly_cost: Option<BigDecimal>,
        pub owner: Option<Uuid>,
        /// Transient, never stored.
        pub notes: Option<String>,
    }

    impl Entity for Server {
        fn descriptor() -> EntityDescriptor {
            EntityDescriptor::new("Server")
                .with_schema_version("2")
                .with_field(FieldDef::new("serverId", FieldType::Long).primary())
                .with_field(FieldDef::new("name", FieldType::Text).secondary())
                .with_field(
                    FieldDef::new("regionId", FieldType::Text)
                        .foreign(Some("Region"))
                        .composite(&["zone", "rack"], true),
                )
                .with_field(FieldDef::new("zone", FieldType::Text))
                .with_field(FieldDef::new("rack", FieldType::nullable(FieldType::Text)))
                .with_field(FieldDef::new("state", FieldType::enumeration::<ServerState>()).secondary())
                .with_field(FieldDef::new("memory", FieldType::Measured(Unit::GIGABYTE)))
                .with_field(FieldDef::new("cpuCount", FieldType::Int))
                .with_field(FieldDef::new("tags", FieldType::array(FieldType::Text)))
                .with_field(FieldDef::new("hourlyCost", FieldType::Decimal))
                .with_field(FieldDef::new("owner", FieldType::Uuid))
                .with_field(FieldDef::new("notes", FieldType::Text).transient())
                .with_join(EntityJoin::new(REGION_ENTITY, "regionId", "regionId"))
                .with_mapper(FnMapper::new("0", "1", |mut r: Record| {
                    if let Some(name) = r.remove("hostname") {
                        r.insert("name".to_string(), name);
                    }
                    Ok(r)
                }))
                .with_mapper(FnMapper::new("1", "2", |mut r: Record| {
                    if let Some(cpus) = r.remove("cpus") {
                        r.insert("cpuCount".to_string(), cpus);
                    }
                    Ok(r)
                }))
        }

        fn from_state(mut state: State) -> PersistResult<Self> {
            Ok(Self {
                server_id: state.take("serverId")?,
                name: state.take("name")?,
                region_id: state.take("regionId")?,
                zone: state.take("zone")?,
                rack: state.take("rack")?,
                state: state.take_enum("state")?,
                memory: state.take("memory")?,
                cpu_count: state.take("cpuCount")?,
                tags: state.take("tags")?,
                hourly_cost: state.take("hourlyCost")?,
                owner: state.take("owner")?,
                notes: state.take("notes")?,
            })
        }

        fn to_state(&self) -> State {
            State::new()
                .with("serverId", self.server_id)
                .with("name", self.name.clone())
                .with("regionId", self.region_id.clone())
                .with("zone", self.zone.clone())
                .with("rack", self.rack.clone())
                .with("state", FieldValue::enumeration(&self.state))
                .with("memory", self.memory)
                .with("cpuCount", self.cpu_count)
                .with("tags", self.tags.clone())
                .with("hourlyCost", self.hourly_cost.clone())
                .with("owner", self.owner)
                .with("notes", self.notes.clone())
        }
    }

    /// A region servers are placed in.
    #[derive(Debug, Clone, PartialEq)]
    pub struct Region {
        pub region_id: String,
        pub display_name: String,
    }

    impl Entity for Region {
        fn descriptor() -> EntityDescriptor {
            EntityDescriptor::new("Region")
                .with_field(FieldDef::new("regionId", FieldType::Text).primary())
                .with_field(FieldDef::new("displayName", FieldType::Text))
        }

        fn from_state(mut state: State) -> PersistResult<Self> {
            Ok(Self {
                region_id: state.take("regionId")?,
                display_name: state.take("displayName")?,
            })
        }

        fn to_state(&self) -> State {
            State::new()
                .with("regionId", self.region_id.clone())
                .with("displayName", self.display_name.clone())
        }
    }

    /// A running server in `region`, zone `a`, with 16 GB and 4 cpus.
    pub fn server(id: i64, name: &str, region: &str) -> Server {
        Server {
            server_id: id,
            name: name.to_string(),
            region_id: region.to_string(),
            zone: "a".to_string(),
            rack: None,
            state: ServerState::Running,
            memory: Some(Measured::new(16.0, Unit::GIGABYTE)),
            cpu_count: 4,
            tags: vec!["web".to_string()],
            hourly_cost: None,
            owner: None,
            notes: None,
        }
    }

    /// Stored record of a current-version server row.
    pub fn server_record(id: i64, name: &str, region: &str) -> Record {
        record(json!({
            "serverId": id,
            "name": name,
            "regionId": region,
            "zone": "a",
            "state": "RUNNING",
            "memory": 16,
            "cpuCount": 4,
            "tags": ["web"],
            "SCHEMA_VERSION": "2"
        }))
    }

    /// Stored record of a server written at schema version 0.
    pub fn legacy_server_record(id: i64, hostname: &str, region: &str) -> Record {
        record(json!({
            "serverId": id,
            "hostname": hostname,
            "regionId": region,
            "zone": "a",
            "state": "PENDING",
            "memory": "2048MB",
            "cpus": 2,
            "SCHEMA_VERSION": "0"
        }))
    }

    /// Memory storage seeded with `count` servers (`srv-1`..) across two
    /// regions, plus both regions, on the default datasource.
    pub async fn seeded_storage(count: i64) -> MemoryStorage {
        let storage = MemoryStorage::new();
        let datasource = concord_core::DEFAULT_DATASOURCE;
        for (region, name) in [("us-east", "US East"), ("eu-west", "EU West")] {
            storage
                .insert_row(
                    datasource,
                    REGION_ENTITY,
                    "regionId",
                    record(json!({"regionId": region, "displayName": name})),
                )
                .await;
        }
        for id in 1..=count {
            let region = if id % 2 == 0 { "eu-west" } else { "us-east" };
            storage
                .insert_row(
                    datasource,
                    SERVER_ENTITY,
                    "serverId",
                    server_record(id, &format!("srv-{id}"), region),
                )
                .await;
        }
        storage
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for fixture entities.

    use super::fixtures::{Server, ServerState};
    use concord_core::{Measured, Unit};
    use proptest::prelude::*;

    pub fn arb_server_state() -> impl Strategy<Value = ServerState> {
        prop_oneof![
            Just(ServerState::Pending),
            Just(ServerState::Running),
            Just(ServerState::Stopped),
        ]
    }

    /// Memory sizes in whole gigabytes.
    pub fn arb_memory() -> impl Strategy<Value = Option<Measured>> {
        prop::option::of((1u32..1024).prop_map(|gb| Measured::new(f64::from(gb), Unit::GIGABYTE)))
    }

    pub fn arb_name() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9-]{0,15}"
    }

    pub fn arb_region() -> impl Strategy<Value = String> {
        prop_oneof![Just("us-east".to_string()), Just("eu-west".to_string())]
    }

    /// A server with a stored-form-safe field set; `notes` is always `None`
    /// since it never survives storage.
    pub fn arb_server() -> impl Strategy<Value = Server> {
        (
            1i64..1_000_000,
            arb_name(),
            arb_region(),
            prop::option::of("r[0-9]{1,2}"),
            arb_server_state(),
            arb_memory(),
            1i32..256,
            prop::collection::vec(arb_name(), 0..4),
        )
            .prop_map(|(server_id, name, region_id, rack, state, memory, cpu_count, tags)| Server {
                server_id,
                name,
                region_id,
                zone: "a".to_string(),
                rack,
                state,
                memory,
                cpu_count,
                tags,
                hourly_cost: None,
                owner: None,
                notes: None,
            })
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on concord results.

    use super::*;
    use concord_core::{ConfigError, ValidationError};

    /// Assert that a PersistResult is a Config error.
    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &PersistResult<T>) {
        match result {
            Err(PersistError::Config(_)) => {}
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }

    /// Assert that a PersistResult is a Storage error.
    #[track_caller]
    pub fn assert_storage_error<T: std::fmt::Debug>(result: &PersistResult<T>) {
        match result {
            Err(PersistError::Storage(_)) => {}
            other => panic!("Expected Storage error, got: {:?}", other),
        }
    }

    /// Assert that a PersistResult is a validator rejection of `field`.
    #[track_caller]
    pub fn assert_rejected<T: std::fmt::Debug>(result: &PersistResult<T>, field: &str) {
        match result {
            Err(PersistError::Validation(ValidationError::Rejected { field: f, .. })) => {
                assert_eq!(f, field, "Wrong field in Rejected error");
            }
            other => panic!("Expected Rejected error for {}, got: {:?}", field, other),
        }
    }

    /// Assert that a PersistResult reports an incomplete migration.
    #[track_caller]
    pub fn assert_incomplete_migration<T: std::fmt::Debug>(result: &PersistResult<T>) {
        match result {
            Err(PersistError::Config(ConfigError::IncompleteMigration { .. })) => {}
            other => panic!("Expected IncompleteMigration error, got: {:?}", other),
        }
    }

    /// Assert that two handles point at the same cached instance.
    #[track_caller]
    pub fn assert_same_instance<T>(a: &Arc<T>, b: &Arc<T>) {
        assert!(Arc::ptr_eq(a, b), "Expected the same cached instance");
    }
}

// ============================================================================
// TESTS
// ============================================================================
