use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

mod history;
mod ledger;
mod registry;
mod store;
mod substrate;
mod validator;

pub use history::{verify_fruit_log, HistoryIter, HistoryReconstructor, HistoryVerification};
pub use ledger::{ProvenanceLedger, StageReceipt};
pub use registry::UserRegistry;
pub use store::RecordStore;
pub use substrate::{
    chain_hash, verify_chain, ChainSummary, CommitMeta, LedgerKey, LedgerSubstrate, LogEntry,
    MemoryLedger, TxContext, VersionedValue, WriteOp, WriteSet, GENESIS_HASH,
};
pub use validator::StageValidator;

const MAX_CODE_LEN: usize = 64;
const MAX_USER_ID_LEN: usize = 128;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ProvenanceError {
    #[error("not found: {key}")]
    NotFound { key: String },
    #[error("traceability code already exists: {code}")]
    DuplicateCode { code: String },
    #[error("user already registered: {user_id}")]
    DuplicateUser { user_id: String },
    #[error(
        "invalid transition for {stage} stage: expected state {expected}, actual state {actual}"
    )]
    InvalidTransition { stage: Stage, expected: StageState, actual: StageState },
    #[error("role {actual} may not write the {stage} stage (requires {required})")]
    UnauthorizedRole { stage: Stage, required: UserType, actual: UserType },
    #[error("write conflict on {key}; retry against the current state")]
    Conflict { key: String },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("history for {key} failed verification at sequence {sequence}: {reason}")]
    Tampered { key: String, sequence: u64, reason: String },
    #[error("storage error: {0}")]
    Storage(String),
}

impl ProvenanceError {
    /// Only a lost write race is worth retrying; every other error is terminal
    /// for the request that produced it.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::DuplicateCode { .. } => "duplicate_code",
            Self::DuplicateUser { .. } => "duplicate_user",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::UnauthorizedRole { .. } => "unauthorized_role",
            Self::Conflict { .. } => "conflict",
            Self::Validation(_) => "validation",
            Self::Encoding(_) => "encoding",
            Self::Tampered { .. } => "tampered",
            Self::Storage(_) => "storage",
        }
    }
}

/// Globally unique identifier of one traced lot, minted at the origin stage.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct TraceabilityCode(String);

impl TraceabilityCode {
    /// Parse and validate a caller-supplied traceability code.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::Validation`] when the code is empty, longer than 64
    /// characters, or contains characters outside `[A-Za-z0-9._-]`.
    pub fn parse(value: &str) -> Result<Self, ProvenanceError> {
        if value.is_empty() || value.len() > MAX_CODE_LEN {
            return Err(ProvenanceError::Validation(format!(
                "traceability_code MUST be 1..={MAX_CODE_LEN} characters"
            )));
        }
        if !value.chars().all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.')) {
            return Err(ProvenanceError::Validation(format!(
                "traceability_code contains unsupported characters: {value}"
            )));
        }
        Ok(Self(value.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TraceabilityCode {
    type Error = ProvenanceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TraceabilityCode> for String {
    fn from(value: TraceabilityCode) -> Self {
        value.0
    }
}

impl FromStr for TraceabilityCode {
    type Err = ProvenanceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl Display for TraceabilityCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    /// Parse a participant identifier.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::Validation`] when the identifier is blank or too long.
    pub fn parse(value: &str) -> Result<Self, ProvenanceError> {
        if value.trim().is_empty() {
            return Err(ProvenanceError::Validation("userID MUST be provided".to_string()));
        }
        if value.len() > MAX_USER_ID_LEN {
            return Err(ProvenanceError::Validation(format!(
                "userID MUST be at most {MAX_USER_ID_LEN} characters"
            )));
        }
        Ok(Self(value.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for UserId {
    type Error = ProvenanceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<UserId> for String {
    fn from(value: UserId) -> Self {
        value.0
    }
}

impl FromStr for UserId {
    type Err = ProvenanceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transaction identifier minted by the ledger substrate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TxId(pub Ulid);

impl TxId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// # Errors
    /// Returns [`ProvenanceError::Encoding`] when `value` is not a ULID.
    pub fn parse(value: &str) -> Result<Self, ProvenanceError> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|err| ProvenanceError::Encoding(format!("invalid tx id {value}: {err}")))
    }
}

impl Default for TxId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for TxId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    Producer,
    Processor,
    Carrier,
    Retailer,
    Consumer,
}

impl UserType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Producer => "producer",
            Self::Processor => "processor",
            Self::Carrier => "carrier",
            Self::Retailer => "retailer",
            Self::Consumer => "consumer",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "producer" => Some(Self::Producer),
            "processor" => Some(Self::Processor),
            "carrier" => Some(Self::Carrier),
            "retailer" => Some(Self::Retailer),
            "consumer" => Some(Self::Consumer),
            _ => None,
        }
    }
}

impl Display for UserType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Farmer,
    Factory,
    Driver,
    Shop,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Self::Farmer, Self::Factory, Self::Driver, Self::Shop];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Farmer => "farmer",
            Self::Factory => "factory",
            Self::Driver => "driver",
            Self::Shop => "shop",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "farmer" => Some(Self::Farmer),
            "factory" => Some(Self::Factory),
            "driver" => Some(Self::Driver),
            "shop" => Some(Self::Shop),
            _ => None,
        }
    }

    #[must_use]
    pub fn required_role(self) -> UserType {
        match self {
            Self::Farmer => UserType::Producer,
            Self::Factory => UserType::Processor,
            Self::Driver => UserType::Carrier,
            Self::Shop => UserType::Retailer,
        }
    }

    /// State a record must be in before this stage may be written.
    #[must_use]
    pub fn predecessor_state(self) -> StageState {
        match self {
            Self::Farmer => StageState::Uncreated,
            Self::Factory => StageState::FarmerSet,
            Self::Driver => StageState::FactorySet,
            Self::Shop => StageState::DriverSet,
        }
    }

    #[must_use]
    pub fn resulting_state(self) -> StageState {
        match self {
            Self::Farmer => StageState::FarmerSet,
            Self::Factory => StageState::FactorySet,
            Self::Driver => StageState::DriverSet,
            Self::Shop => StageState::ShopSet,
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageState {
    Uncreated,
    FarmerSet,
    FactorySet,
    DriverSet,
    ShopSet,
}

impl StageState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uncreated => "UNCREATED",
            Self::FarmerSet => "FARMER_SET",
            Self::FactorySet => "FACTORY_SET",
            Self::DriverSet => "DRIVER_SET",
            Self::ShopSet => "SHOP_SET",
        }
    }

    /// The stage that may be written next, or `None` once the record is terminal.
    #[must_use]
    pub fn next_stage(self) -> Option<Stage> {
        match self {
            Self::Uncreated => Some(Stage::Farmer),
            Self::FarmerSet => Some(Stage::Factory),
            Self::FactorySet => Some(Stage::Driver),
            Self::DriverSet => Some(Stage::Shop),
            Self::ShopSet => None,
        }
    }
}

impl Display for StageState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the participant invoking an operation, as supplied by the
/// identity substrate. It is trusted, never re-verified here.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Caller {
    pub user_id: UserId,
    pub user_type: UserType,
}

impl Caller {
    #[must_use]
    pub fn new(user_id: UserId, user_type: UserType) -> Self {
        Self { user_id, user_type }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FarmerInput {
    #[serde(rename = "fa_fruitName")]
    pub fruit_name: String,
    #[serde(rename = "fa_origin")]
    pub origin: String,
    #[serde(rename = "fa_plantTime")]
    pub plant_time: String,
    #[serde(rename = "fa_pickingTime")]
    pub picking_time: String,
    #[serde(rename = "fa_farmerName")]
    pub farmer_name: String,
    #[serde(rename = "fa_imgHash")]
    pub img_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FactoryInput {
    #[serde(rename = "fac_productName")]
    pub product_name: String,
    #[serde(rename = "fac_productionbatch")]
    pub production_batch: String,
    #[serde(rename = "fac_productionTime")]
    pub production_time: String,
    #[serde(rename = "fac_factoryName")]
    pub factory_name: String,
    #[serde(rename = "fac_contactNumber")]
    pub contact_number: String,
    #[serde(rename = "fac_imgHash")]
    pub img_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DriverInput {
    #[serde(rename = "dr_name")]
    pub name: String,
    #[serde(rename = "dr_age")]
    pub age: String,
    #[serde(rename = "dr_phone")]
    pub phone: String,
    #[serde(rename = "dr_carNumber")]
    pub car_number: String,
    #[serde(rename = "dr_transport")]
    pub transport: String,
    #[serde(rename = "dr_imgHash")]
    pub img_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ShopInput {
    #[serde(rename = "sh_storeTime")]
    pub store_time: String,
    #[serde(rename = "sh_sellTime")]
    pub sell_time: String,
    #[serde(rename = "sh_shopName")]
    pub shop_name: String,
    #[serde(rename = "sh_shopAddress")]
    pub shop_address: String,
    #[serde(rename = "sh_shopPhone")]
    pub shop_phone: String,
    #[serde(rename = "sh_imgHash")]
    pub img_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FarmerRecord {
    #[serde(flatten)]
    pub input: FarmerInput,
    #[serde(rename = "fa_txid")]
    pub tx_id: TxId,
    #[serde(rename = "fa_timestamp", with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FactoryRecord {
    #[serde(flatten)]
    pub input: FactoryInput,
    #[serde(rename = "fac_txid")]
    pub tx_id: TxId,
    #[serde(rename = "fac_timestamp", with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DriverRecord {
    #[serde(flatten)]
    pub input: DriverInput,
    #[serde(rename = "dr_txid")]
    pub tx_id: TxId,
    #[serde(rename = "dr_timestamp", with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ShopRecord {
    #[serde(flatten)]
    pub input: ShopInput,
    #[serde(rename = "sh_txid")]
    pub tx_id: TxId,
    #[serde(rename = "sh_timestamp", with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Stage data as submitted by a participant, before the substrate stamps it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "stage", content = "input", rename_all = "snake_case")]
pub enum StageSubmission {
    Farmer(FarmerInput),
    Factory(FactoryInput),
    Driver(DriverInput),
    Shop(ShopInput),
}

impl StageSubmission {
    #[must_use]
    pub fn stage(&self) -> Stage {
        match self {
            Self::Farmer(_) => Stage::Farmer,
            Self::Factory(_) => Stage::Factory,
            Self::Driver(_) => Stage::Driver,
            Self::Shop(_) => Stage::Shop,
        }
    }

    /// Check required domain fields and the artifact content hash.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::Validation`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ProvenanceError> {
        let (fields, img_hash): (Vec<(&str, &str)>, (&str, &str)) = match self {
            Self::Farmer(input) => (
                vec![
                    ("fa_fruitName", input.fruit_name.as_str()),
                    ("fa_origin", input.origin.as_str()),
                    ("fa_pickingTime", input.picking_time.as_str()),
                    ("fa_farmerName", input.farmer_name.as_str()),
                ],
                ("fa_imgHash", input.img_hash.as_str()),
            ),
            Self::Factory(input) => (
                vec![
                    ("fac_productName", input.product_name.as_str()),
                    ("fac_productionbatch", input.production_batch.as_str()),
                    ("fac_productionTime", input.production_time.as_str()),
                    ("fac_factoryName", input.factory_name.as_str()),
                ],
                ("fac_imgHash", input.img_hash.as_str()),
            ),
            Self::Driver(input) => (
                vec![
                    ("dr_name", input.name.as_str()),
                    ("dr_carNumber", input.car_number.as_str()),
                    ("dr_transport", input.transport.as_str()),
                ],
                ("dr_imgHash", input.img_hash.as_str()),
            ),
            Self::Shop(input) => (
                vec![
                    ("sh_storeTime", input.store_time.as_str()),
                    ("sh_shopName", input.shop_name.as_str()),
                    ("sh_shopAddress", input.shop_address.as_str()),
                ],
                ("sh_imgHash", input.img_hash.as_str()),
            ),
        };

        for (name, value) in fields {
            if value.trim().is_empty() {
                return Err(ProvenanceError::Validation(format!("{name} MUST be provided")));
            }
        }
        validate_content_hash(img_hash.0, img_hash.1)
    }
}

/// The traced unit. `state` is stored explicitly rather than inferred from
/// which sub-records happen to be populated.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Fruit {
    pub traceability_code: TraceabilityCode,
    pub state: StageState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub farmer_input: Option<FarmerRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory_input: Option<FactoryRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_input: Option<DriverRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shop_input: Option<ShopRecord>,
}

impl Fruit {
    #[must_use]
    pub fn new(traceability_code: TraceabilityCode) -> Self {
        Self {
            traceability_code,
            state: StageState::Uncreated,
            farmer_input: None,
            factory_input: None,
            driver_input: None,
            shop_input: None,
        }
    }

    #[must_use]
    pub fn has_stage(&self, stage: Stage) -> bool {
        match stage {
            Stage::Farmer => self.farmer_input.is_some(),
            Stage::Factory => self.factory_input.is_some(),
            Stage::Driver => self.driver_input.is_some(),
            Stage::Shop => self.shop_input.is_some(),
        }
    }

    /// State implied by the populated sub-records, or `None` when a later stage
    /// is present while an earlier one is missing.
    #[must_use]
    pub fn populated_state(&self) -> Option<StageState> {
        let mut state = StageState::Uncreated;
        let mut gap = false;
        for stage in Stage::ALL {
            if self.has_stage(stage) {
                if gap {
                    return None;
                }
                state = stage.resulting_state();
            } else {
                gap = true;
            }
        }
        Some(state)
    }

    /// Commit stamp of one stage sub-record, if written.
    #[must_use]
    pub fn stage_stamp(&self, stage: Stage) -> Option<(TxId, OffsetDateTime)> {
        match stage {
            Stage::Farmer => self.farmer_input.as_ref().map(|r| (r.tx_id, r.timestamp)),
            Stage::Factory => self.factory_input.as_ref().map(|r| (r.tx_id, r.timestamp)),
            Stage::Driver => self.driver_input.as_ref().map(|r| (r.tx_id, r.timestamp)),
            Stage::Shop => self.shop_input.as_ref().map(|r| (r.tx_id, r.timestamp)),
        }
    }

    /// Attach a stage sub-record stamped with the substrate-issued transaction
    /// context and advance the state. Callers validate the transition first.
    fn attach(&mut self, submission: StageSubmission, ctx: &TxContext) {
        let (tx_id, timestamp) = (ctx.tx_id, ctx.timestamp);
        self.state = submission.stage().resulting_state();
        match submission {
            StageSubmission::Farmer(input) => {
                self.farmer_input = Some(FarmerRecord { input, tx_id, timestamp });
            }
            StageSubmission::Factory(input) => {
                self.factory_input = Some(FactoryRecord { input, tx_id, timestamp });
            }
            StageSubmission::Driver(input) => {
                self.driver_input = Some(DriverRecord { input, tx_id, timestamp });
            }
            StageSubmission::Shop(input) => {
                self.shop_input = Some(ShopRecord { input, tx_id, timestamp });
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct User {
    #[serde(rename = "userID")]
    pub user_id: UserId,
    #[serde(rename = "userType")]
    pub user_type: UserType,
    #[serde(rename = "realInfoHash")]
    pub real_info_hash: String,
    #[serde(rename = "fruitList", default)]
    pub fruit_list: Vec<TraceabilityCode>,
}

/// One historical snapshot of a Fruit at a given commit.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HistoryQueryResult {
    pub record: Option<Fruit>,
    #[serde(rename = "txId")]
    pub tx_id: TxId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(rename = "isDelete")]
    pub is_delete: bool,
}

/// Validate a `sha256:<hex>` content-hash reference to an off-ledger artifact.
///
/// # Errors
/// Returns [`ProvenanceError::Validation`] when the value is not 64 hex digits
/// behind a `sha256:` prefix.
pub fn validate_content_hash(field: &str, value: &str) -> Result<(), ProvenanceError> {
    let Some(digest) = value.strip_prefix("sha256:") else {
        return Err(ProvenanceError::Validation(format!(
            "{field} MUST be formatted as sha256:<hex>"
        )));
    };
    if digest.len() != 64 || !digest.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return Err(ProvenanceError::Validation(format!(
            "{field} MUST carry a 64 character hex sha256 digest"
        )));
    }
    Ok(())
}

pub(crate) fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>, ProvenanceError> {
    serde_json::to_vec(value).map_err(|err| ProvenanceError::Encoding(err.to_string()))
}

pub(crate) fn decode_json<T: serde::de::DeserializeOwned>(
    bytes: &[u8],
) -> Result<T, ProvenanceError> {
    serde_json::from_slice(bytes).map_err(|err| ProvenanceError::Encoding(err.to_string()))
}
