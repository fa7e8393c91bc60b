// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright © 2024 Adrian <adrian.eddy at gmail>

use chrono::NaiveDate;
use serde::{ Serialize, Deserialize };
use crate::lookup_table::Dimensions;

/// A camera whose raw frames are larger than its advertised output.
/// Tables for it are solved at `native` size and centre-cropped.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct DeviceQuirk {
    pub make: String,
    pub model: String,
    pub native: Dimensions,
    /// Date the sensor was remounted upright. Frames captured before it are upside down.
    #[serde(default)]
    pub rotation_cutoff: Option<NaiveDate>,
}

impl DeviceQuirk {
    pub fn matches(&self, make: &str, model: &str) -> bool {
        self.make.trim() == make.trim() && self.model.trim() == model.trim()
    }

    /// Missing dates predate the remount.
    pub fn rotation_applies(&self, as_of_date: Option<NaiveDate>) -> bool {
        match (self.rotation_cutoff, as_of_date) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(cutoff), Some(date)) => date < cutoff,
        }
    }

    /// Top-left corner of the centred `requested` window, if it fits.
    pub fn crop_origin(&self, requested: Dimensions) -> Option<(usize, usize)> {
        if requested.w > self.native.w || requested.h > self.native.h {
            return None;
        }
        Some(((self.native.w - requested.w) / 2, (self.native.h - requested.h) / 2))
    }
}

pub fn find<'a>(quirks: &'a [DeviceQuirk], make: &str, model: &str) -> Option<&'a DeviceQuirk> {
    quirks.iter().find(|q| q.matches(make, model))
}
