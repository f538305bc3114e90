//! External entity representation
//!
//! These are the shapes exchanged with peers and with the local application.
//! Every provable entity carries a creation group (fingerprint, creation,
//! proof of work, signature) and an update group (last update, update proof
//! of work, update signature). The `verified` flag is set upstream by the
//! signature / proof-of-work verifier and is the only thing the engine
//! trusts about authenticity.

use serde::{Deserialize, Serialize};

pub type Timestamp = i64;
pub type Fingerprint = String;

// =============================================================================
// Shared field groups
// =============================================================================

/// Creation group. Immutable once stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvableFields {
    pub fingerprint: Fingerprint,
    pub creation: Timestamp,
    #[serde(default)]
    pub proof_of_work: String,
    #[serde(default)]
    pub signature: String,
}

/// Update group. Zero / empty until the entity is amended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateFields {
    #[serde(default)]
    pub last_update: Timestamp,
    #[serde(default)]
    pub update_proof_of_work: String,
    #[serde(default)]
    pub update_signature: String,
}

// =============================================================================
// Entities
// =============================================================================

/// Moderation grant on a board
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardOwner {
    pub key_fingerprint: Fingerprint,
    #[serde(default)]
    pub expiry: Timestamp,
    pub level: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    #[serde(flatten)]
    pub provable: ProvableFields,
    #[serde(flatten)]
    pub update: UpdateFields,
    pub name: String,
    #[serde(default)]
    pub board_owners: Vec<BoardOwner>,
    #[serde(default)]
    pub description: String,
    pub owner: Fingerprint,
    pub owner_public_key: String,
    pub entity_version: i32,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub meta: String,
    #[serde(default)]
    pub realm_id: Fingerprint,
    #[serde(default)]
    pub encr_content: String,
    #[serde(default)]
    pub verified: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    #[serde(flatten)]
    pub provable: ProvableFields,
    #[serde(flatten)]
    pub update: UpdateFields,
    pub board: Fingerprint,
    pub name: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub link: String,
    pub owner: Fingerprint,
    pub owner_public_key: String,
    pub entity_version: i32,
    #[serde(default)]
    pub meta: String,
    #[serde(default)]
    pub realm_id: Fingerprint,
    #[serde(default)]
    pub encr_content: String,
    #[serde(default)]
    pub verified: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    #[serde(flatten)]
    pub provable: ProvableFields,
    #[serde(flatten)]
    pub update: UpdateFields,
    pub board: Fingerprint,
    pub thread: Fingerprint,
    /// Parent post, or the thread fingerprint for a top-level reply
    pub parent: Fingerprint,
    pub body: String,
    pub owner: Fingerprint,
    pub owner_public_key: String,
    pub entity_version: i32,
    #[serde(default)]
    pub meta: String,
    #[serde(default)]
    pub realm_id: Fingerprint,
    #[serde(default)]
    pub encr_content: String,
    #[serde(default)]
    pub verified: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    #[serde(flatten)]
    pub provable: ProvableFields,
    #[serde(flatten)]
    pub update: UpdateFields,
    pub board: Fingerprint,
    pub thread: Fingerprint,
    pub target: Fingerprint,
    pub owner: Fingerprint,
    pub owner_public_key: String,
    #[serde(default)]
    pub type_class: i32,
    #[serde(rename = "type")]
    pub vote_type: i32,
    pub entity_version: i32,
    #[serde(default)]
    pub meta: String,
    #[serde(default)]
    pub realm_id: Fingerprint,
    #[serde(default)]
    pub encr_content: String,
    #[serde(default)]
    pub verified: bool,
}

/// Public key. A key is its own owner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    #[serde(flatten)]
    pub provable: ProvableFields,
    #[serde(flatten)]
    pub update: UpdateFields,
    #[serde(rename = "type")]
    pub key_type: String,
    pub public_key: String,
    #[serde(default)]
    pub expiry: Timestamp,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub info: String,
    pub entity_version: i32,
    #[serde(default)]
    pub meta: String,
    #[serde(default)]
    pub realm_id: Fingerprint,
    #[serde(default)]
    pub verified: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Truststate {
    #[serde(flatten)]
    pub provable: ProvableFields,
    #[serde(flatten)]
    pub update: UpdateFields,
    pub target: Fingerprint,
    pub owner: Fingerprint,
    pub owner_public_key: String,
    #[serde(default)]
    pub type_class: i32,
    #[serde(rename = "type")]
    pub trust_type: i32,
    #[serde(default)]
    pub domain: Fingerprint,
    #[serde(default)]
    pub expiry: Timestamp,
    pub entity_version: i32,
    #[serde(default)]
    pub meta: String,
    #[serde(default)]
    pub realm_id: Fingerprint,
    #[serde(default)]
    pub encr_content: String,
    #[serde(default)]
    pub verified: bool,
}

/// Protocol extension advertised by a peer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subprotocol {
    pub name: String,
    pub version_major: u8,
    #[serde(default)]
    pub version_minor: u16,
    #[serde(default)]
    pub supported_entities: Vec<String>,
}

/// Peer network location. Identified by (location, sublocation, port).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub location: String,
    #[serde(default)]
    pub sublocation: String,
    /// 4 = IPv4, 6 = IPv6, 3 = URL
    #[serde(default)]
    pub location_type: u8,
    pub port: u16,
    /// 2 = live, 3 = bootstrapper, 255 = static
    #[serde(default)]
    pub address_type: u8,
    #[serde(default)]
    pub last_successful_ping: Timestamp,
    #[serde(default)]
    pub last_successful_sync: Timestamp,
    #[serde(default)]
    pub protocol_version_major: u8,
    #[serde(default)]
    pub protocol_version_minor: u16,
    #[serde(default)]
    pub subprotocols: Vec<Subprotocol>,
    #[serde(default)]
    pub client_version_major: u8,
    #[serde(default)]
    pub client_version_minor: u16,
    #[serde(default)]
    pub client_version_patch: u16,
    #[serde(default)]
    pub client_name: String,
    pub entity_version: i32,
    #[serde(default)]
    pub realm_id: Fingerprint,
    #[serde(default)]
    pub verified: bool,
}

// =============================================================================
// Kinds
// =============================================================================

/// Entity kind. Doubles as the name used by readers ("boards", "keys", ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Boards,
    Threads,
    Posts,
    Votes,
    Keys,
    Truststates,
    Addresses,
}

impl EntityKind {
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Boards,
        EntityKind::Threads,
        EntityKind::Posts,
        EntityKind::Votes,
        EntityKind::Keys,
        EntityKind::Truststates,
        EntityKind::Addresses,
    ];

    /// Backing table
    pub fn table(&self) -> &'static str {
        match self {
            Self::Boards => "boards",
            Self::Threads => "threads",
            Self::Posts => "posts",
            Self::Votes => "votes",
            Self::Keys => "public_keys",
            Self::Truststates => "truststates",
            Self::Addresses => "addresses",
        }
    }

    pub fn is_provable(&self) -> bool {
        !matches!(self, Self::Addresses)
    }
}

impl std::str::FromStr for EntityKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "boards" => Ok(Self::Boards),
            "threads" => Ok(Self::Threads),
            "posts" => Ok(Self::Posts),
            "votes" => Ok(Self::Votes),
            "keys" => Ok(Self::Keys),
            "truststates" => Ok(Self::Truststates),
            "addresses" => Ok(Self::Addresses),
            _ => Err(format!("Unknown entity kind '{}'", s)),
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Boards => "boards",
            Self::Threads => "threads",
            Self::Posts => "posts",
            Self::Votes => "votes",
            Self::Keys => "keys",
            Self::Truststates => "truststates",
            Self::Addresses => "addresses",
        };
        write!(f, "{}", name)
    }
}

/// Any entity that can be handed to the write engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Entity {
    Board(Board),
    Thread(Thread),
    Post(Post),
    Vote(Vote),
    Key(Key),
    Truststate(Truststate),
    Address(Address),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Board(_) => EntityKind::Boards,
            Entity::Thread(_) => EntityKind::Threads,
            Entity::Post(_) => EntityKind::Posts,
            Entity::Vote(_) => EntityKind::Votes,
            Entity::Key(_) => EntityKind::Keys,
            Entity::Truststate(_) => EntityKind::Truststates,
            Entity::Address(_) => EntityKind::Addresses,
        }
    }

    pub fn is_verified(&self) -> bool {
        match self {
            Entity::Board(e) => e.verified,
            Entity::Thread(e) => e.verified,
            Entity::Post(e) => e.verified,
            Entity::Vote(e) => e.verified,
            Entity::Key(e) => e.verified,
            Entity::Truststate(e) => e.verified,
            Entity::Address(e) => e.verified,
        }
    }

    /// Short identity for log lines
    pub fn label(&self) -> String {
        match self {
            Entity::Board(e) => e.provable.fingerprint.clone(),
            Entity::Thread(e) => e.provable.fingerprint.clone(),
            Entity::Post(e) => e.provable.fingerprint.clone(),
            Entity::Vote(e) => e.provable.fingerprint.clone(),
            Entity::Key(e) => e.provable.fingerprint.clone(),
            Entity::Truststate(e) => e.provable.fingerprint.clone(),
            Entity::Address(e) => format!("{}/{}:{}", e.location, e.sublocation, e.port),
        }
    }
}

/// Read result. Embeds land in the slot of their own kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub boards: Vec<Board>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub threads: Vec<Thread>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub posts: Vec<Post>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub votes: Vec<Vote>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<Key>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub truststates: Vec<Truststate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<Address>,
}

impl Response {
    pub fn is_empty(&self) -> bool {
        self.boards.is_empty()
            && self.threads.is_empty()
            && self.posts.is_empty()
            && self.votes.is_empty()
            && self.keys.is_empty()
            && self.truststates.is_empty()
            && self.addresses.is_empty()
    }
}
