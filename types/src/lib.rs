#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt::Formatter;

/// Number of analog channels on every supported sampler.
pub const CHANNEL_COUNT: usize = 4;

/// One validated reading across the four analog channels.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Sample {
    pub an1: u16,
    pub an2: u16,
    pub an3: u16,
    pub an4: u16,
}

impl Sample {
    pub fn new(an1: u16, an2: u16, an3: u16, an4: u16) -> Self {
        Self { an1, an2, an3, an4 }
    }

    pub fn channels(&self) -> [u16; CHANNEL_COUNT] {
        [self.an1, self.an2, self.an3, self.an4]
    }
}

impl std::fmt::Display for Sample {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "an1={} an2={} an3={} an4={}",
            self.an1, self.an2, self.an3, self.an4
        )
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DeviceType {
    QuadVolt,
    QuadVoltMk1,
    Unknown,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::QuadVolt => write!(f, "QuadVolt"),
            DeviceType::QuadVoltMk1 => write!(f, "QuadVolt Mk1"),
            DeviceType::Unknown => write!(f, "Unknown Device"),
        }
    }
}
