/*
 * SPDX-License-Identifier: Apache-2.0
 */

use std::str::FromStr;

bitflags::bitflags! {
    /// Server capabilities advertised through FEAT.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct FtpFeatureSet: u32 {
        const MLST = 0x0001;
        const MDTM = 0x0002;
        const REST_STREAM = 0x0004;
        const SIZE = 0x0008;
        const UTF8 = 0x0010;
        const PRET = 0x0020;
        const MFMT = 0x0040;
        const MFCT = 0x0080;
        const MFF = 0x0100;
        const MD5 = 0x0200;
        const XMD5 = 0x0400;
        const XCRC = 0x0800;
        const XSHA1 = 0x1000;
        const XSHA256 = 0x2000;
        const XSHA512 = 0x4000;
        const HASH = 0x8000;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FtpHashAlgorithm {
    Sha1,
    Sha256,
    Sha512,
    Md5,
    Crc,
}

impl FromStr for FtpHashAlgorithm {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sha-1" => Ok(FtpHashAlgorithm::Sha1),
            "sha-256" => Ok(FtpHashAlgorithm::Sha256),
            "sha-512" => Ok(FtpHashAlgorithm::Sha512),
            "md5" => Ok(FtpHashAlgorithm::Md5),
            "crc" => Ok(FtpHashAlgorithm::Crc),
            _ => Err(()),
        }
    }
}

/// What the server told us it can do.
///
/// Populated once from the FEAT reply body; cloned sessions inherit the
/// populated registry instead of probing again.
#[derive(Clone, Debug, Default)]
pub struct FtpServerFeatures {
    set: FtpFeatureSet,
    hash_algorithms: Vec<FtpHashAlgorithm>,
    default_hash: Option<FtpHashAlgorithm>,
}

impl FtpServerFeatures {
    pub(crate) fn parse_feat_lines<'a, I>(lines: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut features = FtpServerFeatures::default();
        for line in lines {
            features.parse_and_set(line);
        }
        features
    }

    fn parse_and_set(&mut self, s: &str) {
        let s = s.trim();
        let (f, v) = s.split_once(' ').unwrap_or((s, ""));
        match f.to_lowercase().as_str() {
            "mlst" | "mlsd" => self.set |= FtpFeatureSet::MLST,
            "mdtm" => self.set |= FtpFeatureSet::MDTM,
            "rest" => {
                if v.to_lowercase().eq("stream") {
                    self.set |= FtpFeatureSet::REST_STREAM;
                }
            }
            "size" => self.set |= FtpFeatureSet::SIZE,
            "utf8" => self.set |= FtpFeatureSet::UTF8,
            "pret" => self.set |= FtpFeatureSet::PRET,
            "mfmt" => self.set |= FtpFeatureSet::MFMT,
            "mfct" => self.set |= FtpFeatureSet::MFCT,
            "mff" => self.set |= FtpFeatureSet::MFF,
            "md5" => self.set |= FtpFeatureSet::MD5,
            "xmd5" => self.set |= FtpFeatureSet::XMD5,
            "xcrc" => self.set |= FtpFeatureSet::XCRC,
            "xsha1" => self.set |= FtpFeatureSet::XSHA1,
            "xsha256" => self.set |= FtpFeatureSet::XSHA256,
            "xsha512" => self.set |= FtpFeatureSet::XSHA512,
            "hash" => {
                self.set |= FtpFeatureSet::HASH;
                self.parse_hash_list(v);
            }
            _ => {}
        }
    }

    /// HASH value syntax: `ALGO[*];ALGO;…`, `*` marking the server default.
    fn parse_hash_list(&mut self, v: &str) {
        for token in v.split(';') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let (name, is_default) = match token.strip_suffix('*') {
                Some(name) => (name, true),
                None => (token, false),
            };
            if let Ok(algo) = FtpHashAlgorithm::from_str(name) {
                if !self.hash_algorithms.contains(&algo) {
                    self.hash_algorithms.push(algo);
                }
                if is_default {
                    self.default_hash = Some(algo);
                }
            }
        }
    }

    #[inline]
    pub fn has(&self, feature: FtpFeatureSet) -> bool {
        self.set.contains(feature)
    }

    #[inline]
    pub fn set(&self) -> FtpFeatureSet {
        self.set
    }

    #[inline]
    pub fn hash_algorithms(&self) -> &[FtpHashAlgorithm] {
        self.hash_algorithms.as_slice()
    }

    #[inline]
    pub fn default_hash_algorithm(&self) -> Option<FtpHashAlgorithm> {
        self.default_hash
    }
}
