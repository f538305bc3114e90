//! Storage-side records
//!
//! Rows as they live in SQLite. Provable rows add two engine-managed columns
//! the external representation never carries: `local_arrival` (first stored
//! here) and `last_referenced` (last touched by a write or by a write that
//! references it).

use rusqlite::types::Value;
use rusqlite::Row;
use serde::Serialize;

use crate::entities::{EntityKind, Fingerprint, ProvableFields, Timestamp, UpdateFields};

/// Column name paired with the value to bind for it
pub type Binding = (&'static str, Value);

/// Common surface of the six provable row types
pub trait ProvableRow: Sized {
    const KIND: EntityKind;

    /// Columns an accepted update may rewrite, besides the update group and
    /// `last_referenced`. Creation-group columns are never listed.
    const MUTABLE_COLUMNS: &'static [&'static str];

    fn provable(&self) -> &ProvableFields;
    fn update(&self) -> &UpdateFields;
    fn last_referenced(&self) -> Timestamp;

    /// Every column with its value, in a stable order
    fn bindings(&self) -> Vec<Binding>;

    fn from_row(row: &Row) -> Result<Self, rusqlite::Error>;

    fn fingerprint(&self) -> &str {
        &self.provable().fingerprint
    }
}

fn provable_from_row(row: &Row) -> Result<ProvableFields, rusqlite::Error> {
    Ok(ProvableFields {
        fingerprint: row.get("fingerprint")?,
        creation: row.get("creation")?,
        proof_of_work: row.get("proof_of_work")?,
        signature: row.get("signature")?,
    })
}

fn update_from_row(row: &Row) -> Result<UpdateFields, rusqlite::Error> {
    Ok(UpdateFields {
        last_update: row.get("last_update")?,
        update_proof_of_work: row.get("update_proof_of_work")?,
        update_signature: row.get("update_signature")?,
    })
}

fn common_bindings(
    provable: &ProvableFields,
    update: &UpdateFields,
    local_arrival: Timestamp,
    last_referenced: Timestamp,
) -> Vec<Binding> {
    vec![
        ("fingerprint", Value::from(provable.fingerprint.clone())),
        ("creation", Value::from(provable.creation)),
        ("proof_of_work", Value::from(provable.proof_of_work.clone())),
        ("signature", Value::from(provable.signature.clone())),
        ("last_update", Value::from(update.last_update)),
        ("update_proof_of_work", Value::from(update.update_proof_of_work.clone())),
        ("update_signature", Value::from(update.update_signature.clone())),
        ("local_arrival", Value::from(local_arrival)),
        ("last_referenced", Value::from(last_referenced)),
    ]
}

// =============================================================================
// Provable rows
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BoardRow {
    pub provable: ProvableFields,
    pub update: UpdateFields,
    pub name: String,
    pub owner: Fingerprint,
    pub owner_public_key: String,
    pub description: String,
    pub local_arrival: Timestamp,
    pub last_referenced: Timestamp,
    pub entity_version: i32,
    pub language: String,
    pub meta: String,
    pub realm_id: Fingerprint,
    pub encr_content: String,
}

impl ProvableRow for BoardRow {
    const KIND: EntityKind = EntityKind::Boards;
    const MUTABLE_COLUMNS: &'static [&'static str] =
        &["description", "language", "meta", "encr_content", "entity_version"];

    fn provable(&self) -> &ProvableFields {
        &self.provable
    }

    fn update(&self) -> &UpdateFields {
        &self.update
    }

    fn last_referenced(&self) -> Timestamp {
        self.last_referenced
    }

    fn bindings(&self) -> Vec<Binding> {
        let mut b = common_bindings(&self.provable, &self.update, self.local_arrival, self.last_referenced);
        b.extend([
            ("name", Value::from(self.name.clone())),
            ("owner", Value::from(self.owner.clone())),
            ("owner_public_key", Value::from(self.owner_public_key.clone())),
            ("description", Value::from(self.description.clone())),
            ("entity_version", Value::from(self.entity_version)),
            ("language", Value::from(self.language.clone())),
            ("meta", Value::from(self.meta.clone())),
            ("realm_id", Value::from(self.realm_id.clone())),
            ("encr_content", Value::from(self.encr_content.clone())),
        ]);
        b
    }

    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            provable: provable_from_row(row)?,
            update: update_from_row(row)?,
            name: row.get("name")?,
            owner: row.get("owner")?,
            owner_public_key: row.get("owner_public_key")?,
            description: row.get("description")?,
            local_arrival: row.get("local_arrival")?,
            last_referenced: row.get("last_referenced")?,
            entity_version: row.get("entity_version")?,
            language: row.get("language")?,
            meta: row.get("meta")?,
            realm_id: row.get("realm_id")?,
            encr_content: row.get("encr_content")?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ThreadRow {
    pub provable: ProvableFields,
    pub update: UpdateFields,
    pub board: Fingerprint,
    pub name: String,
    pub body: String,
    pub link: String,
    pub owner: Fingerprint,
    pub owner_public_key: String,
    pub local_arrival: Timestamp,
    pub last_referenced: Timestamp,
    pub entity_version: i32,
    pub meta: String,
    pub realm_id: Fingerprint,
    pub encr_content: String,
}

impl ProvableRow for ThreadRow {
    const KIND: EntityKind = EntityKind::Threads;
    const MUTABLE_COLUMNS: &'static [&'static str] =
        &["body", "link", "meta", "encr_content", "entity_version"];

    fn provable(&self) -> &ProvableFields {
        &self.provable
    }

    fn update(&self) -> &UpdateFields {
        &self.update
    }

    fn last_referenced(&self) -> Timestamp {
        self.last_referenced
    }

    fn bindings(&self) -> Vec<Binding> {
        let mut b = common_bindings(&self.provable, &self.update, self.local_arrival, self.last_referenced);
        b.extend([
            ("board", Value::from(self.board.clone())),
            ("name", Value::from(self.name.clone())),
            ("body", Value::from(self.body.clone())),
            ("link", Value::from(self.link.clone())),
            ("owner", Value::from(self.owner.clone())),
            ("owner_public_key", Value::from(self.owner_public_key.clone())),
            ("entity_version", Value::from(self.entity_version)),
            ("meta", Value::from(self.meta.clone())),
            ("realm_id", Value::from(self.realm_id.clone())),
            ("encr_content", Value::from(self.encr_content.clone())),
        ]);
        b
    }

    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            provable: provable_from_row(row)?,
            update: update_from_row(row)?,
            board: row.get("board")?,
            name: row.get("name")?,
            body: row.get("body")?,
            link: row.get("link")?,
            owner: row.get("owner")?,
            owner_public_key: row.get("owner_public_key")?,
            local_arrival: row.get("local_arrival")?,
            last_referenced: row.get("last_referenced")?,
            entity_version: row.get("entity_version")?,
            meta: row.get("meta")?,
            realm_id: row.get("realm_id")?,
            encr_content: row.get("encr_content")?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PostRow {
    pub provable: ProvableFields,
    pub update: UpdateFields,
    pub board: Fingerprint,
    pub thread: Fingerprint,
    pub parent: Fingerprint,
    pub body: String,
    pub owner: Fingerprint,
    pub owner_public_key: String,
    pub local_arrival: Timestamp,
    pub last_referenced: Timestamp,
    pub entity_version: i32,
    pub meta: String,
    pub realm_id: Fingerprint,
    pub encr_content: String,
}

impl ProvableRow for PostRow {
    const KIND: EntityKind = EntityKind::Posts;
    const MUTABLE_COLUMNS: &'static [&'static str] =
        &["body", "meta", "encr_content", "entity_version"];

    fn provable(&self) -> &ProvableFields {
        &self.provable
    }

    fn update(&self) -> &UpdateFields {
        &self.update
    }

    fn last_referenced(&self) -> Timestamp {
        self.last_referenced
    }

    fn bindings(&self) -> Vec<Binding> {
        let mut b = common_bindings(&self.provable, &self.update, self.local_arrival, self.last_referenced);
        b.extend([
            ("board", Value::from(self.board.clone())),
            ("thread", Value::from(self.thread.clone())),
            ("parent", Value::from(self.parent.clone())),
            ("body", Value::from(self.body.clone())),
            ("owner", Value::from(self.owner.clone())),
            ("owner_public_key", Value::from(self.owner_public_key.clone())),
            ("entity_version", Value::from(self.entity_version)),
            ("meta", Value::from(self.meta.clone())),
            ("realm_id", Value::from(self.realm_id.clone())),
            ("encr_content", Value::from(self.encr_content.clone())),
        ]);
        b
    }

    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            provable: provable_from_row(row)?,
            update: update_from_row(row)?,
            board: row.get("board")?,
            thread: row.get("thread")?,
            parent: row.get("parent")?,
            body: row.get("body")?,
            owner: row.get("owner")?,
            owner_public_key: row.get("owner_public_key")?,
            local_arrival: row.get("local_arrival")?,
            last_referenced: row.get("last_referenced")?,
            entity_version: row.get("entity_version")?,
            meta: row.get("meta")?,
            realm_id: row.get("realm_id")?,
            encr_content: row.get("encr_content")?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VoteRow {
    pub provable: ProvableFields,
    pub update: UpdateFields,
    pub board: Fingerprint,
    pub thread: Fingerprint,
    pub target: Fingerprint,
    pub owner: Fingerprint,
    pub owner_public_key: String,
    pub type_class: i32,
    pub vote_type: i32,
    pub local_arrival: Timestamp,
    pub last_referenced: Timestamp,
    pub entity_version: i32,
    pub meta: String,
    pub realm_id: Fingerprint,
    pub encr_content: String,
}

impl ProvableRow for VoteRow {
    const KIND: EntityKind = EntityKind::Votes;
    const MUTABLE_COLUMNS: &'static [&'static str] =
        &["type", "meta", "encr_content", "entity_version"];

    fn provable(&self) -> &ProvableFields {
        &self.provable
    }

    fn update(&self) -> &UpdateFields {
        &self.update
    }

    fn last_referenced(&self) -> Timestamp {
        self.last_referenced
    }

    fn bindings(&self) -> Vec<Binding> {
        let mut b = common_bindings(&self.provable, &self.update, self.local_arrival, self.last_referenced);
        b.extend([
            ("board", Value::from(self.board.clone())),
            ("thread", Value::from(self.thread.clone())),
            ("target", Value::from(self.target.clone())),
            ("owner", Value::from(self.owner.clone())),
            ("owner_public_key", Value::from(self.owner_public_key.clone())),
            ("type_class", Value::from(self.type_class)),
            ("type", Value::from(self.vote_type)),
            ("entity_version", Value::from(self.entity_version)),
            ("meta", Value::from(self.meta.clone())),
            ("realm_id", Value::from(self.realm_id.clone())),
            ("encr_content", Value::from(self.encr_content.clone())),
        ]);
        b
    }

    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            provable: provable_from_row(row)?,
            update: update_from_row(row)?,
            board: row.get("board")?,
            thread: row.get("thread")?,
            target: row.get("target")?,
            owner: row.get("owner")?,
            owner_public_key: row.get("owner_public_key")?,
            type_class: row.get("type_class")?,
            vote_type: row.get("type")?,
            local_arrival: row.get("local_arrival")?,
            last_referenced: row.get("last_referenced")?,
            entity_version: row.get("entity_version")?,
            meta: row.get("meta")?,
            realm_id: row.get("realm_id")?,
            encr_content: row.get("encr_content")?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KeyRow {
    pub provable: ProvableFields,
    pub update: UpdateFields,
    pub key_type: String,
    pub public_key: String,
    pub expiry: Timestamp,
    pub name: String,
    pub info: String,
    pub local_arrival: Timestamp,
    pub last_referenced: Timestamp,
    pub entity_version: i32,
    pub meta: String,
    pub realm_id: Fingerprint,
}

impl ProvableRow for KeyRow {
    const KIND: EntityKind = EntityKind::Keys;
    const MUTABLE_COLUMNS: &'static [&'static str] =
        &["expiry", "name", "info", "meta", "entity_version"];

    fn provable(&self) -> &ProvableFields {
        &self.provable
    }

    fn update(&self) -> &UpdateFields {
        &self.update
    }

    fn last_referenced(&self) -> Timestamp {
        self.last_referenced
    }

    fn bindings(&self) -> Vec<Binding> {
        let mut b = common_bindings(&self.provable, &self.update, self.local_arrival, self.last_referenced);
        b.extend([
            ("type", Value::from(self.key_type.clone())),
            ("public_key", Value::from(self.public_key.clone())),
            ("expiry", Value::from(self.expiry)),
            ("name", Value::from(self.name.clone())),
            ("info", Value::from(self.info.clone())),
            ("entity_version", Value::from(self.entity_version)),
            ("meta", Value::from(self.meta.clone())),
            ("realm_id", Value::from(self.realm_id.clone())),
        ]);
        b
    }

    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            provable: provable_from_row(row)?,
            update: update_from_row(row)?,
            key_type: row.get("type")?,
            public_key: row.get("public_key")?,
            expiry: row.get("expiry")?,
            name: row.get("name")?,
            info: row.get("info")?,
            local_arrival: row.get("local_arrival")?,
            last_referenced: row.get("last_referenced")?,
            entity_version: row.get("entity_version")?,
            meta: row.get("meta")?,
            realm_id: row.get("realm_id")?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TruststateRow {
    pub provable: ProvableFields,
    pub update: UpdateFields,
    pub target: Fingerprint,
    pub owner: Fingerprint,
    pub owner_public_key: String,
    pub type_class: i32,
    pub trust_type: i32,
    pub domain: Fingerprint,
    pub expiry: Timestamp,
    pub local_arrival: Timestamp,
    pub last_referenced: Timestamp,
    pub entity_version: i32,
    pub meta: String,
    pub realm_id: Fingerprint,
    pub encr_content: String,
}

impl ProvableRow for TruststateRow {
    const KIND: EntityKind = EntityKind::Truststates;
    const MUTABLE_COLUMNS: &'static [&'static str] =
        &["type", "expiry", "meta", "encr_content", "entity_version"];

    fn provable(&self) -> &ProvableFields {
        &self.provable
    }

    fn update(&self) -> &UpdateFields {
        &self.update
    }

    fn last_referenced(&self) -> Timestamp {
        self.last_referenced
    }

    fn bindings(&self) -> Vec<Binding> {
        let mut b = common_bindings(&self.provable, &self.update, self.local_arrival, self.last_referenced);
        b.extend([
            ("target", Value::from(self.target.clone())),
            ("owner", Value::from(self.owner.clone())),
            ("owner_public_key", Value::from(self.owner_public_key.clone())),
            ("type_class", Value::from(self.type_class)),
            ("type", Value::from(self.trust_type)),
            ("domain", Value::from(self.domain.clone())),
            ("expiry", Value::from(self.expiry)),
            ("entity_version", Value::from(self.entity_version)),
            ("meta", Value::from(self.meta.clone())),
            ("realm_id", Value::from(self.realm_id.clone())),
            ("encr_content", Value::from(self.encr_content.clone())),
        ]);
        b
    }

    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            provable: provable_from_row(row)?,
            update: update_from_row(row)?,
            target: row.get("target")?,
            owner: row.get("owner")?,
            owner_public_key: row.get("owner_public_key")?,
            type_class: row.get("type_class")?,
            trust_type: row.get("type")?,
            domain: row.get("domain")?,
            expiry: row.get("expiry")?,
            local_arrival: row.get("local_arrival")?,
            last_referenced: row.get("last_referenced")?,
            entity_version: row.get("entity_version")?,
            meta: row.get("meta")?,
            realm_id: row.get("realm_id")?,
            encr_content: row.get("encr_content")?,
        })
    }
}

// =============================================================================
// Sub-records
// =============================================================================

/// Board ownership grant. The parent board timestamps ride along so the
/// owner set can be gated on the board's own update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BoardOwnerRow {
    pub board_fingerprint: Fingerprint,
    pub key_fingerprint: Fingerprint,
    pub expiry: Timestamp,
    pub level: u8,
    #[serde(skip)]
    pub parent_board_creation: Timestamp,
    #[serde(skip)]
    pub parent_board_last_update: Timestamp,
}

impl BoardOwnerRow {
    pub fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            board_fingerprint: row.get("board_fingerprint")?,
            key_fingerprint: row.get("key_fingerprint")?,
            expiry: row.get("expiry")?,
            level: row.get("level")?,
            parent_board_creation: 0,
            parent_board_last_update: 0,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AddressRow {
    pub location: String,
    pub sublocation: String,
    pub port: u16,
    pub location_type: u8,
    pub address_type: u8,
    pub last_successful_ping: Timestamp,
    pub last_successful_sync: Timestamp,
    pub protocol_version_major: u8,
    pub protocol_version_minor: u16,
    pub client_version_major: u8,
    pub client_version_minor: u16,
    pub client_version_patch: u16,
    pub client_name: String,
    pub local_arrival: Timestamp,
    pub entity_version: i32,
    pub realm_id: Fingerprint,
}

impl AddressRow {
    pub fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            location: row.get("location")?,
            sublocation: row.get("sublocation")?,
            port: row.get("port")?,
            location_type: row.get("location_type")?,
            address_type: row.get("address_type")?,
            last_successful_ping: row.get("last_successful_ping")?,
            last_successful_sync: row.get("last_successful_sync")?,
            protocol_version_major: row.get("protocol_version_major")?,
            protocol_version_minor: row.get("protocol_version_minor")?,
            client_version_major: row.get("client_version_major")?,
            client_version_minor: row.get("client_version_minor")?,
            client_version_patch: row.get("client_version_patch")?,
            client_name: row.get("client_name")?,
            local_arrival: row.get("local_arrival")?,
            entity_version: row.get("entity_version")?,
            realm_id: row.get("realm_id")?,
        })
    }

    /// Drop everything a third party could have forged. Only the identity
    /// tuple, entity version, realm and local arrival survive.
    pub fn strip_untrusted(&mut self) {
        self.location_type = 0;
        self.address_type = 0;
        self.last_successful_ping = 0;
        self.last_successful_sync = 0;
        self.protocol_version_major = 0;
        self.protocol_version_minor = 0;
        self.client_version_major = 0;
        self.client_version_minor = 0;
        self.client_version_patch = 0;
        self.client_name = String::new();
    }

    /// Equal in every field except `local_arrival`
    pub fn same_content(&self, other: &AddressRow) -> bool {
        let mut a = self.clone();
        a.local_arrival = other.local_arrival;
        &a == other
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubprotocolRow {
    pub fingerprint: Fingerprint,
    pub name: String,
    pub version_major: u8,
    pub version_minor: u16,
    /// Comma separated entity kinds
    pub supported_entities: String,
}

impl SubprotocolRow {
    pub fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            fingerprint: row.get("fingerprint")?,
            name: row.get("name")?,
            version_major: row.get("version_major")?,
            version_minor: row.get("version_minor")?,
            supported_entities: row.get("supported_entities")?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AddressSubprotocolRow {
    pub address_location: String,
    pub address_sublocation: String,
    pub address_port: u16,
    pub subprotocol_fingerprint: Fingerprint,
}

/// Local bookkeeping for a remote node. Never transmitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeRow {
    pub fingerprint: Fingerprint,
    pub boards_last_checkin: Timestamp,
    pub threads_last_checkin: Timestamp,
    pub posts_last_checkin: Timestamp,
    pub votes_last_checkin: Timestamp,
    pub keys_last_checkin: Timestamp,
    pub truststates_last_checkin: Timestamp,
    pub addresses_last_checkin: Timestamp,
}

impl NodeRow {
    pub fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            fingerprint: row.get("fingerprint")?,
            boards_last_checkin: row.get("boards_last_checkin")?,
            threads_last_checkin: row.get("threads_last_checkin")?,
            posts_last_checkin: row.get("posts_last_checkin")?,
            votes_last_checkin: row.get("votes_last_checkin")?,
            keys_last_checkin: row.get("keys_last_checkin")?,
            truststates_last_checkin: row.get("truststates_last_checkin")?,
            addresses_last_checkin: row.get("addresses_last_checkin")?,
        })
    }
}

// =============================================================================
// Conversion output
// =============================================================================

/// What one external entity becomes on the storage side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageRecord {
    Board {
        board: BoardRow,
        owners: Vec<BoardOwnerRow>,
    },
    Thread(ThreadRow),
    Post(PostRow),
    Vote(VoteRow),
    Key(KeyRow),
    Truststate(TruststateRow),
    Address {
        address: AddressRow,
        subprotocols: Vec<SubprotocolRow>,
        junctions: Vec<AddressSubprotocolRow>,
    },
}

impl StorageRecord {
    pub fn kind(&self) -> EntityKind {
        match self {
            StorageRecord::Board { .. } => EntityKind::Boards,
            StorageRecord::Thread(_) => EntityKind::Threads,
            StorageRecord::Post(_) => EntityKind::Posts,
            StorageRecord::Vote(_) => EntityKind::Votes,
            StorageRecord::Key(_) => EntityKind::Keys,
            StorageRecord::Truststate(_) => EntityKind::Truststates,
            StorageRecord::Address { .. } => EntityKind::Addresses,
        }
    }
}
