//! Core domain model, sector rules and ticker-code derivation for coseed.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "coseed-core";

/// Label assigned when no rule matches a company name.
pub const FALLBACK_SECTOR: &str = "その他";

const CODE_MIN: u32 = 1000;
const CODE_SPAN: u32 = 9000;

/// Built-in keyword table, evaluated top to bottom.
const BUILTIN_RULES: &[(&str, &[&str])] = &[
    ("銀行業", &["銀行"]),
    ("証券業", &["証券"]),
    ("保険業", &["保険"]),
    ("不動産業", &["不動産"]),
    ("建設業", &["建設", "建築"]),
    ("電気機器", &["電機", "電気", "電子"]),
    ("輸送用機器", &["自動車", "モーター"]),
    ("陸運業", &["鉄道", "旅客"]),
    ("海運業", &["海運", "船"]),
    ("空運業", &["航空", "エアライン"]),
    ("医薬品", &["製薬", "薬品", "薬局"]),
    ("化学", &["化学", "化成"]),
    ("食料品", &["食品", "製菓", "飲料"]),
    ("鉄鋼", &["鉄鋼", "製鉄"]),
    ("機械", &["機械", "機器"]),
    ("卸売業", &["商事", "商社", "商業"]),
    ("小売業", &["百貨店", "ストア", "マート"]),
    ("サービス業", &["ホテル", "旅館", "リゾート"]),
    ("情報・通信業", &["ソフト", "システム", "IT"]),
    ("ガラス・土石製品", &["ガラス", "セメント"]),
    ("ゴム製品", &["ゴム"]),
    ("繊維製品", &["繊維", "テキスタイル"]),
    ("パルプ・紙", &["紙", "パルプ"]),
    ("電気・ガス業", &["電力"]),
    ("電気・ガス業", &["ガス"]),
    ("石油・石炭製品", &["石油", "エネルギー"]),
    ("その他製品", &["印刷"]),
    ("精密機器", &["精密"]),
    ("非鉄金属", &["金属"]),
    ("倉庫・運輸関連業", &["倉庫", "物流"]),
    ("情報・通信業", &["通信", "テレコム"]),
    ("情報・通信業", &["メディア", "放送", "テレビ"]),
    ("水産・農林業", &["農", "林", "水産"]),
    ("鉱業", &["鉱業", "鉱山"]),
    ("サービス業", &["サービス"]),
];

/// One keyword rule: the name matches when it contains any of the needles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorRule {
    pub sector: String,
    pub contains_any: Vec<String>,
}

impl SectorRule {
    pub fn new(sector: impl Into<String>, needles: &[&str]) -> Self {
        Self {
            sector: sector.into(),
            contains_any: needles.iter().map(|n| n.to_string()).collect(),
        }
    }

    /// Case-sensitive substring containment; not word-boundary aware.
    pub fn matches(&self, name: &str) -> bool {
        self.contains_any
            .iter()
            .any(|needle| name.contains(needle.as_str()))
    }
}

/// Ordered rule table with a catch-all label. First matching rule wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectorRules {
    rules: Vec<SectorRule>,
    fallback: String,
}

impl Default for SectorRules {
    fn default() -> Self {
        Self::builtin()
    }
}

impl SectorRules {
    pub fn new(rules: Vec<SectorRule>, fallback: impl Into<String>) -> Self {
        Self {
            rules,
            fallback: fallback.into(),
        }
    }

    pub fn builtin() -> Self {
        let rules = BUILTIN_RULES
            .iter()
            .map(|(sector, needles)| SectorRule::new(*sector, needles))
            .collect();
        Self::new(rules, FALLBACK_SECTOR)
    }

    pub fn rules(&self) -> &[SectorRule] {
        &self.rules
    }

    pub fn fallback(&self) -> &str {
        &self.fallback
    }

    pub fn classify(&self, name: &str) -> &str {
        self.rules
            .iter()
            .find(|rule| rule.matches(name))
            .map(|rule| rule.sector.as_str())
            .unwrap_or(self.fallback.as_str())
    }

    /// The closed set of labels `classify` can return, fallback included.
    pub fn labels(&self) -> BTreeSet<&str> {
        self.rules
            .iter()
            .map(|rule| rule.sector.as_str())
            .chain(std::iter::once(self.fallback.as_str()))
            .collect()
    }
}

/// Synthetic 4-digit ticker placeholder in `[1000, 9999]`.
///
/// Derived from the first four bytes of SHA-256(id), so the same id yields the
/// same code on every run and machine. Distinct ids may collide.
pub fn ticker_code(id: &str) -> String {
    let digest = Sha256::digest(id.as_bytes());
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    (prefix % CODE_SPAN + CODE_MIN).to_string()
}

/// A deduplicated company row ready for SQL emission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyRecord {
    pub id: String,
    pub name: String,
    pub sector: String,
    pub code: String,
}

impl CompanyRecord {
    /// Classify and code a company. Callers pass already-trimmed fields.
    pub fn new(id: impl Into<String>, name: impl Into<String>, rules: &SectorRules) -> Self {
        let id = id.into();
        let name = name.into();
        let sector = rules.classify(&name).to_string();
        let code = ticker_code(&id);
        Self {
            id,
            name,
            sector,
            code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_matching_rule_wins() {
        let rules = SectorRules::builtin();
        // 銀行 precedes 証券 in the table.
        assert_eq!(rules.classify("みずほ銀行証券"), "銀行業");
        assert_eq!(rules.classify("野村証券"), "証券業");
        // 電気 (rule 6) beats 電力 (rule 24).
        assert_eq!(rules.classify("東京電気電力"), "電気機器");
        assert_eq!(rules.classify("関西電力"), "電気・ガス業");
        assert_eq!(rules.classify("東京ガス"), "電気・ガス業");
    }

    #[test]
    fn substring_match_is_not_word_aware() {
        let rules = SectorRules::builtin();
        assert_eq!(rules.classify("NITORI Holdings"), "情報・通信業");
        assert_eq!(rules.classify("nitori holdings"), FALLBACK_SECTOR);
    }

    #[test]
    fn unmatched_names_fall_back() {
        let rules = SectorRules::builtin();
        assert_eq!(rules.classify("株式会社ABC"), "その他");
        assert_eq!(rules.classify(""), "その他");
    }

    #[test]
    fn sample_names_classify() {
        let rules = SectorRules::builtin();
        assert_eq!(rules.classify("X銀行株式会社"), "銀行業");
        assert_eq!(rules.classify("Y自動車工業"), "輸送用機器");
    }

    #[test]
    fn classify_always_returns_a_known_label() {
        let rules = SectorRules::builtin();
        let labels = rules.labels();
        for name in ["トヨタ自動車", "", "O'Brien Trading Co.", "日本郵船", "森永製菓", "ソフトバンク"] {
            let label = rules.classify(name);
            assert!(!label.is_empty());
            assert!(labels.contains(label), "{label} not in label set");
            assert_eq!(label, rules.classify(name));
        }
    }

    #[test]
    fn builtin_table_shape() {
        let rules = SectorRules::builtin();
        assert_eq!(rules.rules().len(), 35);
        assert_eq!(rules.rules()[0].sector, "銀行業");
        assert_eq!(rules.rules()[34].sector, "サービス業");
        // 31 distinct rule labels plus the fallback.
        assert_eq!(rules.labels().len(), 32);
    }

    #[test]
    fn ticker_codes_are_pinned() {
        assert_eq!(ticker_code("E001"), "3688");
        assert_eq!(ticker_code("E002"), "7337");
        assert_eq!(ticker_code("hello"), "4114");
    }

    #[test]
    fn ticker_codes_stay_in_range() {
        for i in 0..500 {
            let code = ticker_code(&format!("E{i:05}"));
            assert_eq!(code.len(), 4);
            let n: u32 = code.parse().expect("numeric code");
            assert!((1000..=9999).contains(&n));
        }
    }

    #[test]
    fn record_derives_sector_and_code() {
        let rules = SectorRules::builtin();
        let record = CompanyRecord::new("E001", "X銀行株式会社", &rules);
        assert_eq!(record.sector, "銀行業");
        assert_eq!(record.code, "3688");
    }
}
