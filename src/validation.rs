//! Admission checks run after conversion
//!
//! Identity fields make a row addressable at all. Required fields are the
//! kind-specific minimum for a row to be worth storing. Both fail with
//! [`StorageError::Admission`] and the caller drops the object.

use crate::context::EngineContext;
use crate::db::models::*;
use crate::error::StorageError;

const LOCALHOST: &str = "127.0.0.1";

fn missing(kind: &str, id: &str, field: &str) -> StorageError {
    StorageError::Admission(format!("{} {} is missing required field {}", kind, id, field))
}

/// Fingerprint for provables, location and port for addresses. Localhost is
/// refused as a remote unless explicitly allowed.
pub fn enforce_identity_fields(
    record: &StorageRecord,
    ctx: &EngineContext,
) -> Result<(), StorageError> {
    let fingerprint = match record {
        StorageRecord::Board { board, .. } => &board.provable.fingerprint,
        StorageRecord::Thread(r) => &r.provable.fingerprint,
        StorageRecord::Post(r) => &r.provable.fingerprint,
        StorageRecord::Vote(r) => &r.provable.fingerprint,
        StorageRecord::Key(r) => &r.provable.fingerprint,
        StorageRecord::Truststate(r) => &r.provable.fingerprint,
        StorageRecord::Address { address, .. } => {
            if address.location.is_empty() || address.port == 0 {
                return Err(StorageError::Admission(format!(
                    "Address {:?}:{} has no usable identity",
                    address.location, address.port
                )));
            }
            if address.location == LOCALHOST && !ctx.allow_localhost_remotes {
                return Err(StorageError::Admission(format!(
                    "Address {}:{} points at localhost",
                    address.location, address.port
                )));
            }
            return Ok(());
        }
    };

    if fingerprint.is_empty() {
        return Err(StorageError::Admission(format!(
            "{} without a fingerprint",
            record.kind()
        )));
    }
    Ok(())
}

/// Kind-specific mandatory fields. Proof of work is mandatory only while
/// the context has it enabled.
pub fn enforce_required_fields(
    record: &StorageRecord,
    ctx: &EngineContext,
) -> Result<(), StorageError> {
    let pow = |kind: &str, id: &str, value: &str| {
        if ctx.pow_check_enabled && value.is_empty() {
            Err(missing(kind, id, "proof_of_work"))
        } else {
            Ok(())
        }
    };

    match record {
        StorageRecord::Board { board: b, owners } => {
            let id = &b.provable.fingerprint;
            require("board", id, &[
                ("name", !b.name.is_empty()),
                ("creation", b.provable.creation != 0),
                ("entity_version", b.entity_version != 0),
                ("owner", !b.owner.is_empty()),
                ("owner_public_key", !b.owner_public_key.is_empty()),
            ])?;
            if let Some(o) = owners.iter().find(|o| o.level == 0 || o.key_fingerprint.is_empty()) {
                return Err(StorageError::Admission(format!(
                    "board {} has an invalid owner grant for key {:?}",
                    id, o.key_fingerprint
                )));
            }
            pow("board", id, &b.provable.proof_of_work)
        }
        StorageRecord::Thread(t) => {
            let id = &t.provable.fingerprint;
            require("thread", id, &[
                ("board", !t.board.is_empty()),
                ("name", !t.name.is_empty()),
                ("creation", t.provable.creation != 0),
                ("entity_version", t.entity_version != 0),
                ("owner", !t.owner.is_empty()),
                ("owner_public_key", !t.owner_public_key.is_empty()),
            ])?;
            pow("thread", id, &t.provable.proof_of_work)
        }
        StorageRecord::Post(p) => {
            let id = &p.provable.fingerprint;
            require("post", id, &[
                ("board", !p.board.is_empty()),
                ("thread", !p.thread.is_empty()),
                ("parent", !p.parent.is_empty()),
                ("body", !p.body.is_empty()),
                ("creation", p.provable.creation != 0),
                ("entity_version", p.entity_version != 0),
                ("owner", !p.owner.is_empty()),
                ("owner_public_key", !p.owner_public_key.is_empty()),
            ])?;
            pow("post", id, &p.provable.proof_of_work)
        }
        StorageRecord::Vote(v) => {
            let id = &v.provable.fingerprint;
            require("vote", id, &[
                ("board", !v.board.is_empty()),
                ("thread", !v.thread.is_empty()),
                ("target", !v.target.is_empty()),
                ("owner", !v.owner.is_empty()),
                ("type", v.vote_type != 0),
                ("creation", v.provable.creation != 0),
                ("entity_version", v.entity_version != 0),
                ("signature", !v.provable.signature.is_empty()),
                ("owner_public_key", !v.owner_public_key.is_empty()),
            ])?;
            pow("vote", id, &v.provable.proof_of_work)
        }
        StorageRecord::Key(k) => {
            let id = &k.provable.fingerprint;
            require("key", id, &[
                ("type", !k.key_type.is_empty()),
                ("public_key", !k.public_key.is_empty()),
                ("creation", k.provable.creation != 0),
                ("entity_version", k.entity_version != 0),
                ("signature", !k.provable.signature.is_empty()),
            ])?;
            pow("key", id, &k.provable.proof_of_work)
        }
        StorageRecord::Truststate(ts) => {
            let id = &ts.provable.fingerprint;
            require("truststate", id, &[
                ("target", !ts.target.is_empty()),
                ("owner", !ts.owner.is_empty()),
                ("type", ts.trust_type != 0),
                ("creation", ts.provable.creation != 0),
                ("entity_version", ts.entity_version != 0),
                ("signature", !ts.provable.signature.is_empty()),
                ("owner_public_key", !ts.owner_public_key.is_empty()),
            ])?;
            pow("truststate", id, &ts.provable.proof_of_work)
        }
        StorageRecord::Address { address: a, .. } => {
            let id = format!("{}:{}", a.location, a.port);
            require("address", &id, &[
                ("location", !a.location.is_empty()),
                ("port", a.port != 0),
                ("entity_version", a.entity_version != 0),
            ])
        }
    }
}

/// Extra fields a first-party address write must carry
pub fn enforce_trusted_address_fields(
    address: &AddressRow,
    subprotocols: &[SubprotocolRow],
) -> Result<(), StorageError> {
    let id = format!("{}:{}", address.location, address.port);
    require("address", &id, &[
        ("location_type", address.location_type != 0),
        ("last_successful_ping", address.last_successful_ping != 0),
        ("protocol_version_major", address.protocol_version_major != 0),
        ("client_version_major", address.client_version_major != 0),
        ("client_name", !address.client_name.is_empty()),
        ("entity_version", address.entity_version != 0),
        ("subprotocols", !subprotocols.is_empty()),
    ])?;

    for sp in subprotocols {
        let sp_id = format!("{} of {}", sp.name, id);
        require("subprotocol", &sp_id, &[
            ("name", !sp.name.is_empty()),
            ("version_major", sp.version_major != 0),
            ("supported_entities", !sp.supported_entities.is_empty()),
        ])?;
    }
    Ok(())
}

fn require(kind: &str, id: &str, fields: &[(&str, bool)]) -> Result<(), StorageError> {
    match fields.iter().find(|(_, present)| !present) {
        Some((field, _)) => Err(missing(kind, id, field)),
        None => Ok(()),
    }
}
