//! File back end for the security database
//!
//! Layout, all integers little endian:
//!
//! ```text
//! magic "RBSM" | version u8 | restore u8 | local sign counter u32
//! local identity: present u8, irk [16], address [6], public u8
//! local csrk:     present u8, csrk [16]
//! entry count u16, then per entry:
//!   peer address [6], flag bits u8, key size u8
//!   peer ltk [16], peer ediv u16, peer rand [8]
//!   local ltk [16], local ediv u16, local rand [8]
//!   peer irk [16], identity address [6], identity public u8
//!   peer csrk [16], peer sign counter u32
//! checksum u32 (wrapping byte sum of everything before it)
//! ```

use super::storage::{DbSnapshot, DbStorage};
use super::{
    EntryRecord, SecurityDistributionFlags, SecurityEntryIdentity, SecurityEntryKeys,
    SecurityEntrySigning,
};
use crate::error::{SmError, SmResult};
use crate::gap::BdAddr;
use crate::smp::{Csrk, Ediv, Irk, Ltk, Rand};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, trace};
use std::fs::{self, OpenOptions};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 4] = b"RBSM";
const VERSION: u8 = 1;

const FLAG_PEER_ADDRESS_PUBLIC: u8 = 0x01;
const FLAG_CSRK_STORED: u8 = 0x02;
const FLAG_CSRK_MITM: u8 = 0x04;
const FLAG_LTK_STORED: u8 = 0x08;
const FLAG_LTK_MITM: u8 = 0x10;
const FLAG_LTK_SENT: u8 = 0x20;
const FLAG_IRK_STORED: u8 = 0x40;
const FLAG_SC_PAIRED: u8 = 0x80;

/// Stores the database in a single file, replaced atomically on every sync
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    /// Open (creating if needed) the database file at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> SmResult<Self> {
        let path = path.as_ref().to_path_buf();
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| SmError::Storage(format!("{}: {}", path.display(), e)))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DbStorage for FileStorage {
    fn load(&mut self) -> SmResult<Option<DbSnapshot>> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if data.is_empty() {
            return Ok(None);
        }
        trace!("Read {} bytes from {}", data.len(), self.path.display());
        decode_snapshot(&data).map(Some)
    }

    fn store(&mut self, snapshot: &DbSnapshot) -> SmResult<()> {
        let data = encode_snapshot(snapshot)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &data)?;
        fs::rename(&tmp, &self.path)?;
        debug!(
            "Stored {} bonds in {}",
            snapshot.entries.len(),
            self.path.display()
        );
        Ok(())
    }
}

fn checksum(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |acc, b| acc.wrapping_add(u32::from(*b)))
}

fn write_keys(out: &mut Vec<u8>, keys: &SecurityEntryKeys) -> std::io::Result<()> {
    out.extend_from_slice(keys.ltk.as_bytes());
    out.write_u16::<LittleEndian>(keys.ediv.to_u16())?;
    out.extend_from_slice(keys.rand.as_bytes());
    Ok(())
}

fn write_identity(out: &mut Vec<u8>, identity: &SecurityEntryIdentity) {
    out.extend_from_slice(identity.irk.as_bytes());
    out.extend_from_slice(identity.identity_address.as_slice());
    out.push(identity.identity_address_is_public as u8);
}

fn flag_bits(flags: &SecurityDistributionFlags) -> u8 {
    [
        (flags.peer_address_is_public, FLAG_PEER_ADDRESS_PUBLIC),
        (flags.csrk_stored, FLAG_CSRK_STORED),
        (flags.csrk_mitm_protected, FLAG_CSRK_MITM),
        (flags.ltk_stored, FLAG_LTK_STORED),
        (flags.ltk_mitm_protected, FLAG_LTK_MITM),
        (flags.ltk_sent, FLAG_LTK_SENT),
        (flags.irk_stored, FLAG_IRK_STORED),
        (flags.secure_connections_paired, FLAG_SC_PAIRED),
    ]
    .iter()
    .filter(|(set, _)| *set)
    .fold(0, |bits, (_, bit)| bits | bit)
}

pub(crate) fn encode_snapshot(snapshot: &DbSnapshot) -> SmResult<Vec<u8>> {
    let entry_count = u16::try_from(snapshot.entries.len())
        .map_err(|_| SmError::Storage("too many entries to store".into()))?;

    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    out.push(snapshot.restore as u8);
    out.write_u32::<LittleEndian>(snapshot.local_sign_counter)?;

    match &snapshot.local_identity {
        Some(identity) => {
            out.push(1);
            write_identity(&mut out, identity);
        }
        None => {
            out.push(0);
            write_identity(&mut out, &SecurityEntryIdentity::default());
        }
    }
    out.push(snapshot.local_csrk.is_some() as u8);
    out.extend_from_slice(snapshot.local_csrk.unwrap_or_default().as_bytes());

    out.write_u16::<LittleEndian>(entry_count)?;
    for record in &snapshot.entries {
        out.extend_from_slice(record.flags.peer_address.as_slice());
        out.push(flag_bits(&record.flags));
        out.push(record.flags.encryption_key_size);
        write_keys(&mut out, &record.peer_keys)?;
        write_keys(&mut out, &record.local_keys)?;
        write_identity(&mut out, &record.peer_identity);
        out.extend_from_slice(record.peer_signing.csrk.as_bytes());
        out.write_u32::<LittleEndian>(record.peer_signing.counter)?;
    }

    let sum = checksum(&out);
    out.write_u32::<LittleEndian>(sum)?;
    Ok(out)
}

fn corrupt(err: std::io::Error) -> SmError {
    SmError::CorruptDatabase(err.to_string())
}

fn read_array<const N: usize>(cursor: &mut Cursor<&[u8]>) -> SmResult<[u8; N]> {
    let mut bytes = [0u8; N];
    cursor.read_exact(&mut bytes).map_err(corrupt)?;
    Ok(bytes)
}

fn read_bool(cursor: &mut Cursor<&[u8]>) -> SmResult<bool> {
    Ok(cursor.read_u8().map_err(corrupt)? != 0)
}

fn read_keys(cursor: &mut Cursor<&[u8]>) -> SmResult<SecurityEntryKeys> {
    let ltk = Ltk::new(read_array(cursor)?);
    let ediv = Ediv::from_u16(cursor.read_u16::<LittleEndian>().map_err(corrupt)?);
    let rand = Rand::new(read_array(cursor)?);
    Ok(SecurityEntryKeys { ltk, ediv, rand })
}

fn read_identity(cursor: &mut Cursor<&[u8]>) -> SmResult<SecurityEntryIdentity> {
    Ok(SecurityEntryIdentity {
        irk: Irk::new(read_array(cursor)?),
        identity_address: BdAddr::new(read_array(cursor)?),
        identity_address_is_public: read_bool(cursor)?,
    })
}

pub(crate) fn decode_snapshot(data: &[u8]) -> SmResult<DbSnapshot> {
    if data.len() < MAGIC.len() + 4 {
        return Err(SmError::CorruptDatabase("file too short".into()));
    }
    let (body, trailer) = data.split_at(data.len() - 4);
    let stored_sum = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    if checksum(body) != stored_sum {
        return Err(SmError::CorruptDatabase("checksum mismatch".into()));
    }

    let mut cursor = Cursor::new(body);
    let magic: [u8; 4] = read_array(&mut cursor)?;
    if &magic != MAGIC {
        return Err(SmError::CorruptDatabase("bad magic".into()));
    }
    let version = cursor.read_u8().map_err(corrupt)?;
    if version != VERSION {
        return Err(SmError::CorruptDatabase(format!(
            "unsupported version {version}"
        )));
    }

    let restore = read_bool(&mut cursor)?;
    let local_sign_counter = cursor.read_u32::<LittleEndian>().map_err(corrupt)?;
    let has_identity = read_bool(&mut cursor)?;
    let identity = read_identity(&mut cursor)?;
    let has_csrk = read_bool(&mut cursor)?;
    let csrk = Csrk::new(read_array(&mut cursor)?);

    let count = cursor.read_u16::<LittleEndian>().map_err(corrupt)?;
    let mut entries = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let peer_address = BdAddr::new(read_array(&mut cursor)?);
        let bits = cursor.read_u8().map_err(corrupt)?;
        let encryption_key_size = cursor.read_u8().map_err(corrupt)?;
        let flags = SecurityDistributionFlags {
            peer_address,
            peer_address_is_public: bits & FLAG_PEER_ADDRESS_PUBLIC != 0,
            encryption_key_size,
            csrk_stored: bits & FLAG_CSRK_STORED != 0,
            csrk_mitm_protected: bits & FLAG_CSRK_MITM != 0,
            ltk_stored: bits & FLAG_LTK_STORED != 0,
            ltk_mitm_protected: bits & FLAG_LTK_MITM != 0,
            ltk_sent: bits & FLAG_LTK_SENT != 0,
            irk_stored: bits & FLAG_IRK_STORED != 0,
            secure_connections_paired: bits & FLAG_SC_PAIRED != 0,
        };
        let peer_keys = read_keys(&mut cursor)?;
        let local_keys = read_keys(&mut cursor)?;
        let peer_identity = read_identity(&mut cursor)?;
        let peer_signing = SecurityEntrySigning {
            csrk: Csrk::new(read_array(&mut cursor)?),
            counter: cursor.read_u32::<LittleEndian>().map_err(corrupt)?,
        };
        entries.push(EntryRecord {
            flags,
            peer_keys,
            local_keys,
            peer_identity,
            peer_signing,
        });
    }

    if cursor.position() as usize != body.len() {
        return Err(SmError::CorruptDatabase("trailing data".into()));
    }

    Ok(DbSnapshot {
        restore,
        local_identity: has_identity.then_some(identity),
        local_csrk: has_csrk.then_some(csrk),
        local_sign_counter,
        entries,
    })
}
