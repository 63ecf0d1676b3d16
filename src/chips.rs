use std::fmt;

use clap::ValueEnum;

use crate::error::ValidationError;

/// Chip families supported by the HVPP adapter firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Chip {
    /// ATmega8, ATmega8A, ATmega8L
    Atmega8,

    Atmega48,

    /// ATmega168, ATmega168P, ATmega168PA
    Atmega168,

    /// ATmega328, ATmega328P
    Atmega328,

    /// ATtiny2313, ATtiny2313V
    Attiny2313,

    /// ATmega1284, ATmega1284P
    Atmega1284,
}

impl Chip {
    pub fn profile(self) -> &'static ChipProfile {
        match self {
            Chip::Atmega8 => &CHIP_PROFILES[0],
            Chip::Atmega48 => &CHIP_PROFILES[1],
            Chip::Atmega168 => &CHIP_PROFILES[2],
            Chip::Atmega328 => &CHIP_PROFILES[3],
            Chip::Attiny2313 => &CHIP_PROFILES[4],
            Chip::Atmega1284 => &CHIP_PROFILES[5],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FuseKind {
    Low,
    High,
    Extended,
}

impl fmt::Display for FuseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FuseKind::Low => write!(f, "low"),
            FuseKind::High => write!(f, "high"),
            FuseKind::Extended => write!(f, "extended"),
        }
    }
}

/// Layout of one fuse or lock byte. `bits[n]` names bit n; unimplemented
/// bits have an empty name and are cleared in `mask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuseLayout {
    pub mask: u8,
    pub default: u8,
    pub bits: [&'static str; 8],
}

impl FuseLayout {
    pub fn is_valid(&self, value: u8) -> bool {
        value & !self.mask == 0
    }

    /// Name of every implemented bit and whether it is programmed (reads 0)
    pub fn describe(&self, value: u8) -> Vec<(&'static str, bool)> {
        (0..8)
            .rev()
            .filter(|bit| !self.bits[*bit].is_empty())
            .map(|bit| (self.bits[bit], value & (1 << bit) == 0))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MemoryKind {
    Flash,
    Eeprom,
}

impl MemoryKind {
    /// Memory type operand understood by the adapter
    pub fn type_code(self) -> u8 {
        match self {
            MemoryKind::Flash => 0x01,
            MemoryKind::Eeprom => 0x02,
        }
    }

    /// Bytes per page-size unit: flash pages are counted in words
    pub fn unit_bytes(self) -> usize {
        match self {
            MemoryKind::Flash => 2,
            MemoryKind::Eeprom => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MemoryKind::Flash => "flash",
            MemoryKind::Eeprom => "eeprom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    /// Page size in the adapter's unit (words for flash, bytes for EEPROM)
    pub page_size: u16,
    pub total_bytes: u32,
}

/// Everything the programmer needs to know about one chip family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipProfile {
    pub id: &'static str,

    /// Part code sent to the adapter when entering programming mode
    pub part_code: &'static str,

    /// Accepted signatures, primary part first
    pub signatures: &'static [[u8; 3]],

    pub low_fuse: FuseLayout,
    pub high_fuse: FuseLayout,
    pub extended_fuse: Option<FuseLayout>,
    pub lock: FuseLayout,

    pub flash: MemoryLayout,
    pub eeprom: MemoryLayout,
}

impl ChipProfile {
    pub fn signature(&self) -> [u8; 3] {
        self.signatures[0]
    }

    pub fn matches_signature(&self, signature: [u8; 3]) -> bool {
        self.signatures.contains(&signature)
    }

    pub fn fuse(&self, kind: FuseKind) -> Result<&FuseLayout, ValidationError> {
        match kind {
            FuseKind::Low => Ok(&self.low_fuse),
            FuseKind::High => Ok(&self.high_fuse),
            FuseKind::Extended => {
                self.extended_fuse
                    .as_ref()
                    .ok_or(ValidationError::UnsupportedFuse {
                        chip: self.id,
                        kind,
                    })
            }
        }
    }

    pub fn validate_fuse(&self, kind: FuseKind, value: u8) -> Result<(), ValidationError> {
        let layout = self.fuse(kind)?;
        if layout.is_valid(value) {
            Ok(())
        } else {
            Err(ValidationError::InvalidFuseValue {
                chip: self.id,
                kind,
                value,
                mask: layout.mask,
            })
        }
    }

    pub fn validate_lock(&self, value: u8) -> Result<(), ValidationError> {
        if self.lock.is_valid(value) {
            Ok(())
        } else {
            Err(ValidationError::InvalidLockValue {
                chip: self.id,
                value,
                mask: self.lock.mask,
            })
        }
    }

    pub fn memory(&self, kind: MemoryKind) -> &MemoryLayout {
        match kind {
            MemoryKind::Flash => &self.flash,
            MemoryKind::Eeprom => &self.eeprom,
        }
    }
}

// Bit names are listed from bit 0 upwards.
const CKSEL_SUT_CKOUT_CKDIV8: [&str; 8] = [
    "CKSEL0", "CKSEL1", "CKSEL2", "CKSEL3", "SUT0", "SUT1", "CKOUT", "CKDIV8",
];
const BODLEVEL_LOW3: [&str; 8] = ["BODLEVEL0", "BODLEVEL1", "BODLEVEL2", "", "", "", "", ""];
const SELFPRGEN_ONLY: [&str; 8] = ["SELFPRGEN", "", "", "", "", "", "", ""];
const LOCK_LB: [&str; 8] = ["LB1", "LB2", "", "", "", "", "", ""];
const LOCK_LB_BLB: [&str; 8] = ["LB1", "LB2", "BLB01", "BLB02", "BLB11", "BLB12", "", ""];

pub static CHIP_PROFILES: [ChipProfile; 6] = [
    ChipProfile {
        id: "ATMEGA8(A)(L)",
        part_code: "0008",
        signatures: &[[0x1E, 0x93, 0x07]],
        low_fuse: FuseLayout {
            mask: 0xFF,
            default: 0xE1,
            bits: [
                "CKSEL0", "CKSEL1", "CKSEL2", "CKSEL3", "SUT0", "SUT1", "BODEN", "BODLEVEL",
            ],
        },
        high_fuse: FuseLayout {
            mask: 0xFF,
            default: 0xD9,
            bits: [
                "BOOTRST", "BOOTSZ0", "BOOTSZ1", "EESAVE", "CKOPT", "SPIEN", "WDTON", "RSTDISBL",
            ],
        },
        extended_fuse: None,
        lock: FuseLayout {
            mask: 0x3F,
            default: 0x3F,
            bits: LOCK_LB_BLB,
        },
        flash: MemoryLayout {
            page_size: 32,
            total_bytes: 8 * 1024,
        },
        eeprom: MemoryLayout {
            page_size: 4,
            total_bytes: 512,
        },
    },
    ChipProfile {
        id: "ATMEGA48",
        part_code: "0048",
        signatures: &[[0x1E, 0x92, 0x05]],
        low_fuse: FuseLayout {
            mask: 0xFF,
            default: 0x62,
            bits: CKSEL_SUT_CKOUT_CKDIV8,
        },
        high_fuse: FuseLayout {
            mask: 0xFF,
            default: 0xDF,
            bits: [
                "BODLEVEL0", "BODLEVEL1", "BODLEVEL2", "EESAVE", "WDTON", "SPIEN", "DWEN",
                "RSTDISBL",
            ],
        },
        extended_fuse: Some(FuseLayout {
            mask: 0x01,
            default: 0x01,
            bits: SELFPRGEN_ONLY,
        }),
        lock: FuseLayout {
            mask: 0x03,
            default: 0x03,
            bits: LOCK_LB,
        },
        flash: MemoryLayout {
            page_size: 32,
            total_bytes: 4 * 1024,
        },
        eeprom: MemoryLayout {
            page_size: 4,
            total_bytes: 256,
        },
    },
    ChipProfile {
        id: "ATMEGA168(P)(PA)",
        part_code: "0168",
        signatures: &[[0x1E, 0x94, 0x06], [0x1E, 0x94, 0x0B]],
        low_fuse: FuseLayout {
            mask: 0xFF,
            default: 0x62,
            bits: CKSEL_SUT_CKOUT_CKDIV8,
        },
        high_fuse: FuseLayout {
            mask: 0xFF,
            default: 0xDF,
            bits: [
                "BODLEVEL0", "BODLEVEL1", "BODLEVEL2", "EESAVE", "WDTON", "SPIEN", "DWEN",
                "RSTDISBL",
            ],
        },
        extended_fuse: Some(FuseLayout {
            mask: 0x07,
            default: 0x01,
            bits: ["BOOTRST", "BOOTSZ0", "BOOTSZ1", "", "", "", "", ""],
        }),
        lock: FuseLayout {
            mask: 0x3F,
            default: 0x3F,
            bits: LOCK_LB_BLB,
        },
        flash: MemoryLayout {
            page_size: 64,
            total_bytes: 16 * 1024,
        },
        eeprom: MemoryLayout {
            page_size: 4,
            total_bytes: 512,
        },
    },
    ChipProfile {
        id: "ATMEGA328(P)",
        part_code: "0328",
        signatures: &[[0x1E, 0x95, 0x0F], [0x1E, 0x95, 0x14]],
        low_fuse: FuseLayout {
            mask: 0xFF,
            default: 0x62,
            bits: CKSEL_SUT_CKOUT_CKDIV8,
        },
        high_fuse: FuseLayout {
            mask: 0xFF,
            default: 0xD9,
            bits: [
                "BOOTRST", "BOOTSZ0", "BOOTSZ1", "EESAVE", "WDTON", "SPIEN", "DWEN", "RSTDISBL",
            ],
        },
        extended_fuse: Some(FuseLayout {
            mask: 0x07,
            default: 0x07,
            bits: BODLEVEL_LOW3,
        }),
        lock: FuseLayout {
            mask: 0x3F,
            default: 0x3F,
            bits: LOCK_LB_BLB,
        },
        flash: MemoryLayout {
            page_size: 64,
            total_bytes: 32 * 1024,
        },
        eeprom: MemoryLayout {
            page_size: 4,
            total_bytes: 1024,
        },
    },
    ChipProfile {
        id: "ATTINY2313(V)",
        part_code: "2313",
        signatures: &[[0x1E, 0x91, 0x0A]],
        low_fuse: FuseLayout {
            mask: 0xFF,
            default: 0x64,
            bits: CKSEL_SUT_CKOUT_CKDIV8,
        },
        high_fuse: FuseLayout {
            mask: 0xFF,
            default: 0xDF,
            bits: [
                "RSTDISBL", "BODLEVEL0", "BODLEVEL1", "BODLEVEL2", "WDTON", "SPIEN", "EESAVE",
                "DWEN",
            ],
        },
        extended_fuse: Some(FuseLayout {
            mask: 0x01,
            default: 0x01,
            bits: SELFPRGEN_ONLY,
        }),
        lock: FuseLayout {
            mask: 0x03,
            default: 0x03,
            bits: LOCK_LB,
        },
        flash: MemoryLayout {
            page_size: 16,
            total_bytes: 2 * 1024,
        },
        eeprom: MemoryLayout {
            page_size: 4,
            total_bytes: 128,
        },
    },
    ChipProfile {
        id: "ATMEGA1284(P)",
        part_code: "1284",
        signatures: &[[0x1E, 0x97, 0x06], [0x1E, 0x97, 0x05]],
        low_fuse: FuseLayout {
            mask: 0xFF,
            default: 0x62,
            bits: CKSEL_SUT_CKOUT_CKDIV8,
        },
        high_fuse: FuseLayout {
            mask: 0xFF,
            default: 0x99,
            bits: [
                "BOOTRST", "BOOTSZ0", "BOOTSZ1", "EESAVE", "WDTON", "SPIEN", "JTAGEN", "OCDEN",
            ],
        },
        extended_fuse: Some(FuseLayout {
            mask: 0x07,
            default: 0x07,
            bits: BODLEVEL_LOW3,
        }),
        lock: FuseLayout {
            mask: 0x3F,
            default: 0x3F,
            bits: LOCK_LB_BLB,
        },
        flash: MemoryLayout {
            page_size: 128,
            total_bytes: 128 * 1024,
        },
        eeprom: MemoryLayout {
            page_size: 8,
            total_bytes: 4 * 1024,
        },
    },
];

/// Find a chip profile by its identifier (case-insensitive)
pub fn lookup(chip_id: &str) -> Result<&'static ChipProfile, ValidationError> {
    CHIP_PROFILES
        .iter()
        .find(|profile| profile.id.eq_ignore_ascii_case(chip_id.trim()))
        .ok_or_else(|| ValidationError::UnknownChip(chip_id.to_owned()))
}

/// Identifiers of every supported chip, in display order
pub fn list() -> impl Iterator<Item = &'static str> {
    CHIP_PROFILES.iter().map(|profile| profile.id)
}
