/**
 * game_info.rs
 *
 * Server game-info record, as carried by REGISTER, UPDATE and LISTING.
 *
 * Game Info Protocol v5:
 *   u8      game info version
 *   string  join key
 *   u8      number of GRFs, then per GRF: u32 id, [u8; 16] md5, string name
 *   u32     current game date
 *   u32     game start date
 *   u8 x 6  companies max/on, clients max/on, spectators max/on
 *   string  server name
 *   string  server revision
 *   bool    password protected
 *   bool    dedicated
 *   u16     map width
 *   u16     map height
 *   u8      map set (landscape)
 */

use crate::packet::{
    Packet, PacketError, GRF_NAME_LENGTH, JOIN_KEY_LENGTH, NAME_LENGTH, REVISION_LENGTH,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Version of the game info record we read and write
pub const GAME_INFO_VERSION: u8 = 5;

/// Number of landscapes; anything else decodes as 0
pub const NUM_LANDSCAPES: u8 = 4;

/// Upper bound for dates, day 31-12-5000 counted from 1-1-0
pub const MAX_DATE: u32 = 1_826_212;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GameInfoError {
    #[error("unsupported game info version {0}")]
    UnsupportedVersion(u8),

    #[error(transparent)]
    Packet(#[from] PacketError),
}

/// Identification of a NewGRF used by a server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrfIdentifier {
    pub grf_id: u32,
    pub md5sum: [u8; 16],
    pub name: String,
}

/// Game state a server advertises. Filled in by the game; this crate only
/// moves it over the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameInfo {
    pub join_key: String,
    pub grfs: Vec<GrfIdentifier>,
    pub game_date: u32,
    pub start_date: u32,
    pub companies_max: u8,
    pub companies_on: u8,
    pub clients_max: u8,
    pub clients_on: u8,
    pub spectators_max: u8,
    pub spectators_on: u8,
    pub server_name: String,
    pub server_revision: String,
    pub use_password: bool,
    pub dedicated: bool,
    pub map_width: u16,
    pub map_height: u16,
    pub map_set: u8,
}

impl GameInfo {
    pub fn write_to(&self, p: &mut Packet) {
        p.write_u8(GAME_INFO_VERSION);
        p.write_string(&self.join_key, JOIN_KEY_LENGTH);

        // GRF count is a single byte on the wire
        let grfs = &self.grfs[..self.grfs.len().min(u8::MAX as usize)];
        p.write_u8(grfs.len() as u8);
        for grf in grfs {
            p.write_u32(grf.grf_id);
            p.write_bytes(&grf.md5sum);
            p.write_string(&grf.name, GRF_NAME_LENGTH);
        }

        p.write_u32(self.game_date)
            .write_u32(self.start_date)
            .write_u8(self.companies_max)
            .write_u8(self.companies_on)
            .write_u8(self.clients_max)
            .write_u8(self.clients_on)
            .write_u8(self.spectators_max)
            .write_u8(self.spectators_on)
            .write_string(&self.server_name, NAME_LENGTH)
            .write_string(&self.server_revision, REVISION_LENGTH)
            .write_bool(self.use_password)
            .write_bool(self.dedicated)
            .write_u16(self.map_width)
            .write_u16(self.map_height)
            .write_u8(self.map_set);
    }

    pub fn read_from(p: &mut Packet) -> Result<Self, GameInfoError> {
        let version = p.read_u8()?;
        if version != GAME_INFO_VERSION {
            return Err(GameInfoError::UnsupportedVersion(version));
        }

        let join_key = p.read_string(JOIN_KEY_LENGTH)?;

        let grf_count = p.read_u8()?;
        let mut grfs = Vec::with_capacity(grf_count as usize);
        for _ in 0..grf_count {
            grfs.push(GrfIdentifier {
                grf_id: p.read_u32()?,
                md5sum: p.read_array::<16>()?,
                name: p.read_string(GRF_NAME_LENGTH)?,
            });
        }

        let mut info = GameInfo {
            join_key,
            grfs,
            game_date: p.read_u32()?.min(MAX_DATE),
            start_date: p.read_u32()?.min(MAX_DATE),
            companies_max: p.read_u8()?,
            companies_on: p.read_u8()?,
            clients_max: p.read_u8()?,
            clients_on: p.read_u8()?,
            spectators_max: p.read_u8()?,
            spectators_on: p.read_u8()?,
            server_name: p.read_string(NAME_LENGTH)?,
            server_revision: p.read_string(REVISION_LENGTH)?,
            use_password: p.read_bool()?,
            dedicated: p.read_bool()?,
            map_width: p.read_u16()?,
            map_height: p.read_u16()?,
            map_set: p.read_u8()?,
        };
        if info.map_set >= NUM_LANDSCAPES {
            info.map_set = 0;
        }
        Ok(info)
    }
}

/// Source of the current server state, queried whenever a REGISTER or
/// UPDATE goes out.
pub trait GameInfoProvider {
    fn game_info(&self) -> GameInfo;
}

impl<F> GameInfoProvider for F
where
    F: Fn() -> GameInfo,
{
    fn game_info(&self) -> GameInfo {
        self()
    }
}

/// Git-hash suffix of a revision string ("-g1234abcd..."), if any
fn revision_hash(revision: &str) -> Option<&str> {
    revision.rfind('-').map(|i| &revision[i..])
}

/// Number of hash characters compared, prefix included
const HASH_SUFFIX_LEN: usize = 12;

/// Whether a server running `other` can be joined by a client running `ours`.
/// Exact matches are compatible; otherwise both must carry the same hash suffix.
pub fn is_compatible_revision(ours: &str, other: &str) -> bool {
    let limit = REVISION_LENGTH - 1;
    if crate::packet::truncate_str(ours, limit) == crate::packet::truncate_str(other, limit) {
        return true;
    }

    match (revision_hash(ours), revision_hash(other)) {
        (Some(a), Some(b)) if a.len() > 2 && b.len() > 2 => {
            let a = &a.as_bytes()[..a.len().min(HASH_SUFFIX_LEN)];
            let b = &b.as_bytes()[..b.len().min(HASH_SUFFIX_LEN)];
            a == b
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> GameInfo {
        GameInfo {
            join_key: "ABCD1234".into(),
            grfs: vec![GrfIdentifier {
                grf_id: 0x4d47_0101,
                md5sum: [7u8; 16],
                name: "OpenGFX+ Trains".into(),
            }],
            game_date: 712_000,
            start_date: 711_000,
            companies_max: 15,
            companies_on: 3,
            clients_max: 25,
            clients_on: 4,
            spectators_max: 10,
            spectators_on: 1,
            server_name: "Friendly Transport Co.".into(),
            server_revision: "1.11.0-g1a2b3c4d5e".into(),
            use_password: true,
            dedicated: false,
            map_width: 512,
            map_height: 256,
            map_set: 2,
        }
    }

    fn through_wire(info: &GameInfo) -> GameInfo {
        let mut p = Packet::new(0);
        info.write_to(&mut p);
        let mut p = Packet::from_frame(p.into_frame().unwrap()).unwrap();
        GameInfo::read_from(&mut p).unwrap()
    }

    #[test]
    fn test_fields_survive_the_wire() {
        let info = sample();
        assert_eq!(through_wire(&info), info);
    }

    #[test]
    fn test_long_strings_truncated() {
        let mut info = sample();
        info.server_name = "x".repeat(200);
        let got = through_wire(&info);
        assert_eq!(got.server_name.len(), NAME_LENGTH - 1);
    }

    #[test]
    fn test_out_of_range_values_clamped() {
        let mut info = sample();
        info.map_set = 9;
        info.game_date = u32::MAX;
        let got = through_wire(&info);
        assert_eq!(got.map_set, 0);
        assert_eq!(got.game_date, MAX_DATE);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut p = Packet::new(0);
        p.write_u8(4);
        let mut p = Packet::from_frame(p.into_frame().unwrap()).unwrap();
        assert_eq!(GameInfo::read_from(&mut p), Err(GameInfoError::UnsupportedVersion(4)));
    }

    #[test]
    fn test_closure_is_a_provider() {
        let provider = || sample();
        assert_eq!(provider.game_info().join_key, "ABCD1234");
    }

    #[test]
    fn test_revision_compatibility() {
        assert!(is_compatible_revision("13.0", "13.0"));
        assert!(!is_compatible_revision("13.0", "13.1"));
        assert!(is_compatible_revision("20210601-master-g1a2b3c4d5e", "20210602-fork-g1a2b3c4d5e"));
        assert!(!is_compatible_revision("20210601-master-g1a2b3c4d5e", "20210601-master-g9999999999"));
    }
}
