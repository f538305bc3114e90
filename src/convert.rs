//! Conversion between the external and stored representations
//!
//! `to_storage` is the admission boundary: it refuses anything the upstream
//! verifier did not mark as verified and stamps the engine-local timestamps.
//! The `*_to_external` functions go the other way and re-read the side
//! tables (board owners, subprotocols) that the primary rows do not embed.

use std::collections::HashSet;

use rusqlite::Connection;
use sha2::{Digest, Sha256};

use crate::db::addresses::read_subprotocols;
use crate::db::board_owners::read_board_owners;
use crate::db::models::*;
use crate::entities::*;
use crate::error::StorageError;

/// Most supported-entity names a subprotocol may declare
pub const MAX_SUPPORTED_ENTITIES: usize = 128;
/// Longest supported-entity name, in bytes
pub const MAX_SUPPORTED_ENTITY_NAME: usize = 31;

/// Limits applied when a stored list is read back
const PARSE_MAX_ITEMS: usize = 100;
const PARSE_MAX_ITEM_LEN: usize = 64;

// =============================================================================
// External -> storage
// =============================================================================

/// Convert one verified entity. `now` becomes both local arrival and last
/// referenced.
pub fn to_storage(entity: Entity, now: Timestamp) -> Result<StorageRecord, StorageError> {
    if !entity.is_verified() {
        return Err(StorageError::Admission(format!(
            "{} {} is not verified",
            entity.kind(),
            entity.label()
        )));
    }

    let record = match entity {
        Entity::Board(b) => board_to_storage(b, now),
        Entity::Thread(t) => StorageRecord::Thread(ThreadRow {
            provable: t.provable,
            update: t.update,
            board: t.board,
            name: t.name,
            body: t.body,
            link: t.link,
            owner: t.owner,
            owner_public_key: t.owner_public_key,
            local_arrival: now,
            last_referenced: now,
            entity_version: t.entity_version,
            meta: t.meta,
            realm_id: t.realm_id,
            encr_content: t.encr_content,
        }),
        Entity::Post(p) => {
            if p.parent == p.provable.fingerprint {
                return Err(StorageError::Admission(format!(
                    "Post {} names itself as its parent",
                    p.provable.fingerprint
                )));
            }
            StorageRecord::Post(PostRow {
                provable: p.provable,
                update: p.update,
                board: p.board,
                thread: p.thread,
                parent: p.parent,
                body: p.body,
                owner: p.owner,
                owner_public_key: p.owner_public_key,
                local_arrival: now,
                last_referenced: now,
                entity_version: p.entity_version,
                meta: p.meta,
                realm_id: p.realm_id,
                encr_content: p.encr_content,
            })
        }
        Entity::Vote(v) => StorageRecord::Vote(VoteRow {
            provable: v.provable,
            update: v.update,
            board: v.board,
            thread: v.thread,
            target: v.target,
            owner: v.owner,
            owner_public_key: v.owner_public_key,
            type_class: v.type_class,
            vote_type: v.vote_type,
            local_arrival: now,
            last_referenced: now,
            entity_version: v.entity_version,
            meta: v.meta,
            realm_id: v.realm_id,
            encr_content: v.encr_content,
        }),
        Entity::Key(k) => StorageRecord::Key(KeyRow {
            provable: k.provable,
            update: k.update,
            key_type: k.key_type,
            public_key: k.public_key,
            expiry: k.expiry,
            name: k.name,
            info: k.info,
            local_arrival: now,
            last_referenced: now,
            entity_version: k.entity_version,
            meta: k.meta,
            realm_id: k.realm_id,
        }),
        Entity::Truststate(ts) => StorageRecord::Truststate(TruststateRow {
            provable: ts.provable,
            update: ts.update,
            target: ts.target,
            owner: ts.owner,
            owner_public_key: ts.owner_public_key,
            type_class: ts.type_class,
            trust_type: ts.trust_type,
            domain: ts.domain,
            expiry: ts.expiry,
            local_arrival: now,
            last_referenced: now,
            entity_version: ts.entity_version,
            meta: ts.meta,
            realm_id: ts.realm_id,
            encr_content: ts.encr_content,
        }),
        Entity::Address(a) => address_to_storage(a, now)?,
    };
    Ok(record)
}

fn board_to_storage(b: Board, now: Timestamp) -> StorageRecord {
    // Last grant for a key wins
    let mut seen = HashSet::new();
    let mut owners: Vec<BoardOwnerRow> = b
        .board_owners
        .iter()
        .rev()
        .filter(|o| seen.insert(o.key_fingerprint.clone()))
        .map(|o| BoardOwnerRow {
            board_fingerprint: b.provable.fingerprint.clone(),
            key_fingerprint: o.key_fingerprint.clone(),
            expiry: o.expiry,
            level: o.level,
            parent_board_creation: b.provable.creation,
            parent_board_last_update: b.update.last_update,
        })
        .collect();
    owners.reverse();

    StorageRecord::Board {
        board: BoardRow {
            provable: b.provable,
            update: b.update,
            name: b.name,
            owner: b.owner,
            owner_public_key: b.owner_public_key,
            description: b.description,
            local_arrival: now,
            last_referenced: now,
            entity_version: b.entity_version,
            language: b.language,
            meta: b.meta,
            realm_id: b.realm_id,
            encr_content: b.encr_content,
        },
        owners,
    }
}

fn address_to_storage(a: Address, now: Timestamp) -> Result<StorageRecord, StorageError> {
    let address = AddressRow {
        location: a.location,
        sublocation: a.sublocation,
        port: a.port,
        location_type: a.location_type,
        address_type: a.address_type,
        last_successful_ping: a.last_successful_ping,
        last_successful_sync: a.last_successful_sync,
        protocol_version_major: a.protocol_version_major,
        protocol_version_minor: a.protocol_version_minor,
        client_version_major: a.client_version_major,
        client_version_minor: a.client_version_minor,
        client_version_patch: a.client_version_patch,
        client_name: a.client_name,
        local_arrival: now,
        entity_version: a.entity_version,
        realm_id: a.realm_id,
    };

    let mut subprotocols = Vec::with_capacity(a.subprotocols.len());
    let mut junctions = Vec::with_capacity(a.subprotocols.len());
    for sp in a.subprotocols {
        let row = subprotocol_to_storage(&sp)?;
        junctions.push(AddressSubprotocolRow {
            address_location: address.location.clone(),
            address_sublocation: address.sublocation.clone(),
            address_port: address.port,
            subprotocol_fingerprint: row.fingerprint.clone(),
        });
        subprotocols.push(row);
    }

    Ok(StorageRecord::Address {
        address,
        subprotocols,
        junctions,
    })
}

fn subprotocol_to_storage(sp: &Subprotocol) -> Result<SubprotocolRow, StorageError> {
    let supported_entities = encode_supported_entities(&sp.supported_entities).map_err(|e| {
        StorageError::Admission(format!("Subprotocol {}: {}", sp.name, e))
    })?;
    let mut row = SubprotocolRow {
        fingerprint: String::new(),
        name: sp.name.clone(),
        version_major: sp.version_major,
        version_minor: sp.version_minor,
        supported_entities,
    };
    row.fingerprint = subprotocol_fingerprint(&row)?;
    Ok(row)
}

/// Local identifier of a subprotocol: hex SHA-256 of its JSON form with an
/// empty fingerprint. Never compared across nodes.
pub fn subprotocol_fingerprint(row: &SubprotocolRow) -> Result<Fingerprint, StorageError> {
    let mut unsigned = row.clone();
    unsigned.fingerprint.clear();
    let json = serde_json::to_vec(&unsigned)?;
    Ok(hex::encode(Sha256::digest(&json)))
}

/// Join a supported-entities list into one comma separated string.
/// Bounded in item count and item length, duplicates refused.
pub fn encode_supported_entities(items: &[String]) -> Result<String, String> {
    if items.len() > MAX_SUPPORTED_ENTITIES {
        return Err(format!(
            "{} supported entities, at most {} allowed",
            items.len(),
            MAX_SUPPORTED_ENTITIES
        ));
    }
    let mut seen = HashSet::new();
    for item in items {
        if item.is_empty() {
            return Err("empty supported entity name".into());
        }
        if item.len() > MAX_SUPPORTED_ENTITY_NAME {
            return Err(format!("supported entity name too long: {:?}", item));
        }
        if item.contains(',') {
            return Err(format!("supported entity name contains a comma: {:?}", item));
        }
        if !seen.insert(item.as_str()) {
            return Err(format!("duplicate supported entity {:?}", item));
        }
    }
    Ok(items.join(","))
}

/// Split a stored supported-entities string back into a list
pub fn parse_supported_entities(csv: &str) -> Result<Vec<String>, String> {
    if csv.is_empty() {
        return Ok(vec![]);
    }
    let mut items = Vec::new();
    let mut seen = HashSet::new();
    for (i, raw) in csv.split(',').enumerate() {
        if i >= PARSE_MAX_ITEMS {
            return Err(format!("more than {} supported entities", PARSE_MAX_ITEMS));
        }
        let item = raw.trim();
        if item.is_empty() {
            return Err("empty supported entity name".into());
        }
        if item.len() >= PARSE_MAX_ITEM_LEN {
            return Err(format!("supported entity name too long: {:?}", item));
        }
        if !seen.insert(item.to_string()) {
            return Err(format!("duplicate supported entity {:?}", item));
        }
        items.push(item.to_string());
    }
    Ok(items)
}

// =============================================================================
// Storage -> external
// =============================================================================

// Stored rows were admitted verified, so the external form says so.

/// Re-reads the owner set. A failed read is fatal.
pub fn board_to_external(conn: &Connection, row: BoardRow) -> Result<Board, StorageError> {
    let owners = read_board_owners(conn, &row.provable.fingerprint, None).map_err(|e| {
        StorageError::Fatal(format!(
            "Board owners of {} could not be read: {}",
            row.provable.fingerprint, e
        ))
    })?;

    Ok(Board {
        provable: row.provable,
        update: row.update,
        name: row.name,
        board_owners: owners
            .into_iter()
            .map(|o| BoardOwner {
                key_fingerprint: o.key_fingerprint,
                expiry: o.expiry,
                level: o.level,
            })
            .collect(),
        description: row.description,
        owner: row.owner,
        owner_public_key: row.owner_public_key,
        entity_version: row.entity_version,
        language: row.language,
        meta: row.meta,
        realm_id: row.realm_id,
        encr_content: row.encr_content,
        verified: true,
    })
}

pub fn thread_to_external(row: ThreadRow) -> Thread {
    Thread {
        provable: row.provable,
        update: row.update,
        board: row.board,
        name: row.name,
        body: row.body,
        link: row.link,
        owner: row.owner,
        owner_public_key: row.owner_public_key,
        entity_version: row.entity_version,
        meta: row.meta,
        realm_id: row.realm_id,
        encr_content: row.encr_content,
        verified: true,
    }
}

pub fn post_to_external(row: PostRow) -> Post {
    Post {
        provable: row.provable,
        update: row.update,
        board: row.board,
        thread: row.thread,
        parent: row.parent,
        body: row.body,
        owner: row.owner,
        owner_public_key: row.owner_public_key,
        entity_version: row.entity_version,
        meta: row.meta,
        realm_id: row.realm_id,
        encr_content: row.encr_content,
        verified: true,
    }
}

pub fn vote_to_external(row: VoteRow) -> Vote {
    Vote {
        provable: row.provable,
        update: row.update,
        board: row.board,
        thread: row.thread,
        target: row.target,
        owner: row.owner,
        owner_public_key: row.owner_public_key,
        type_class: row.type_class,
        vote_type: row.vote_type,
        entity_version: row.entity_version,
        meta: row.meta,
        realm_id: row.realm_id,
        encr_content: row.encr_content,
        verified: true,
    }
}

pub fn key_to_external(row: KeyRow) -> Key {
    Key {
        provable: row.provable,
        update: row.update,
        key_type: row.key_type,
        public_key: row.public_key,
        expiry: row.expiry,
        name: row.name,
        info: row.info,
        entity_version: row.entity_version,
        meta: row.meta,
        realm_id: row.realm_id,
        verified: true,
    }
}

pub fn truststate_to_external(row: TruststateRow) -> Truststate {
    Truststate {
        provable: row.provable,
        update: row.update,
        target: row.target,
        owner: row.owner,
        owner_public_key: row.owner_public_key,
        type_class: row.type_class,
        trust_type: row.trust_type,
        domain: row.domain,
        expiry: row.expiry,
        entity_version: row.entity_version,
        meta: row.meta,
        realm_id: row.realm_id,
        encr_content: row.encr_content,
        verified: true,
    }
}

/// Re-reads the linked subprotocols. A failed read or a dangling junction
/// row is fatal; a stored list that no longer parses is an internal error
/// the caller may skip.
pub fn address_to_external(conn: &Connection, row: AddressRow) -> Result<Address, StorageError> {
    let rows = read_subprotocols(conn, &row.location, &row.sublocation, row.port).map_err(|e| {
        if e.is_fatal() {
            e
        } else {
            StorageError::Fatal(format!(
                "Subprotocols of {}/{}:{} could not be read: {}",
                row.location, row.sublocation, row.port, e
            ))
        }
    })?;

    let mut subprotocols = Vec::with_capacity(rows.len());
    for sp in rows {
        let supported_entities = parse_supported_entities(&sp.supported_entities)
            .map_err(|e| StorageError::Internal(format!("Subprotocol {}: {}", sp.name, e)))?;
        subprotocols.push(Subprotocol {
            name: sp.name,
            version_major: sp.version_major,
            version_minor: sp.version_minor,
            supported_entities,
        });
    }

    Ok(Address {
        location: row.location,
        sublocation: row.sublocation,
        location_type: row.location_type,
        port: row.port,
        address_type: row.address_type,
        last_successful_ping: row.last_successful_ping,
        last_successful_sync: row.last_successful_sync,
        protocol_version_major: row.protocol_version_major,
        protocol_version_minor: row.protocol_version_minor,
        subprotocols,
        client_version_major: row.client_version_major,
        client_version_minor: row.client_version_minor,
        client_version_patch: row.client_version_patch,
        client_name: row.client_name,
        entity_version: row.entity_version,
        realm_id: row.realm_id,
        verified: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_unverified_is_refused() {
        let key = Key {
            provable: ProvableFields {
                fingerprint: "k1".into(),
                creation: 1,
                ..Default::default()
            },
            verified: false,
            ..Default::default()
        };
        let err = to_storage(Entity::Key(key), 10).unwrap_err();
        assert!(matches!(err, StorageError::Admission(_)));
    }

    #[test]
    fn test_self_parent_is_refused() {
        let post = Post {
            provable: ProvableFields {
                fingerprint: "p1".into(),
                creation: 1,
                ..Default::default()
            },
            parent: "p1".into(),
            verified: true,
            ..Default::default()
        };
        assert!(matches!(
            to_storage(Entity::Post(post), 10),
            Err(StorageError::Admission(_))
        ));
    }

    #[test]
    fn test_board_owners_dedup_last_wins() {
        let board = Board {
            provable: ProvableFields {
                fingerprint: "b1".into(),
                creation: 5,
                ..Default::default()
            },
            update: UpdateFields {
                last_update: 9,
                ..Default::default()
            },
            board_owners: vec![
                BoardOwner { key_fingerprint: "A".into(), expiry: 0, level: 1 },
                BoardOwner { key_fingerprint: "B".into(), expiry: 0, level: 1 },
                BoardOwner { key_fingerprint: "A".into(), expiry: 0, level: 2 },
            ],
            verified: true,
            ..Default::default()
        };

        match to_storage(Entity::Board(board), 10).unwrap() {
            StorageRecord::Board { board, owners } => {
                assert_eq!(board.local_arrival, 10);
                assert_eq!(board.last_referenced, 10);
                assert_eq!(owners.len(), 2);
                let a = owners.iter().find(|o| o.key_fingerprint == "A").unwrap();
                assert_eq!(a.level, 2);
                assert_eq!(a.parent_board_creation, 5);
                assert_eq!(a.parent_board_last_update, 9);
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_supported_entities_bounds() {
        assert_eq!(
            encode_supported_entities(&strings(&["boards", "threads"])).unwrap(),
            "boards,threads"
        );
        assert!(encode_supported_entities(&strings(&["boards", "boards"])).is_err());
        assert!(encode_supported_entities(&strings(&[""])).is_err());
        assert!(encode_supported_entities(&["x".repeat(32)]).is_err());
        assert!(encode_supported_entities(&strings(&["a,b"])).is_err());

        let too_many: Vec<String> = (0..129).map(|i| format!("e{}", i)).collect();
        assert!(encode_supported_entities(&too_many).is_err());

        assert_eq!(
            parse_supported_entities("boards, threads").unwrap(),
            strings(&["boards", "threads"])
        );
        assert!(parse_supported_entities("").unwrap().is_empty());
        let over_parse_limit: Vec<String> = (0..101).map(|i| format!("e{}", i)).collect();
        assert!(parse_supported_entities(&over_parse_limit.join(",")).is_err());
    }

    #[test]
    fn test_subprotocol_fingerprint_is_content_derived() {
        let sp = Subprotocol {
            name: "c0".into(),
            version_major: 1,
            version_minor: 0,
            supported_entities: strings(&["boards", "threads"]),
        };
        let a = subprotocol_to_storage(&sp).unwrap();
        let b = subprotocol_to_storage(&sp).unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_eq!(a.fingerprint.len(), 64);

        let mut other = sp.clone();
        other.version_minor = 1;
        assert_ne!(subprotocol_to_storage(&other).unwrap().fingerprint, a.fingerprint);
    }
}
