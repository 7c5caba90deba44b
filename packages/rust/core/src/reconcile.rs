//! Pairwise keyword-overlap reconciliation across subclusters.
//!
//! Every unordered pair of subclusters is compared on its own. A phrase
//! present in both sides of a pair is kept by the side with the higher
//! search volume; equal volumes go to the subcluster whose display name sorts
//! first. Pairs are independent, so one phrase may appear in several pairs.
//!
//! Cost is O(S² · K) for S subclusters of K phrases each. S is small.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::Utc;
use tracing::{info, instrument, warn};

use kwengine_shared::{
    FrequencyRecord, IntersectionEntry, IntersectionPair, KwEngineError, ReconciliationDocument,
    Result, StaysIn, SubclusterSnapshot, phrase_key,
};
use kwengine_storage::Storage;

// ---------------------------------------------------------------------------
// Ownership rule
// ---------------------------------------------------------------------------

/// Which side of a pair keeps a phrase seen with `count1` in subcluster
/// `name1` and `count2` in subcluster `name2`.
pub fn stays_in(count1: u64, count2: u64, name1: &str, name2: &str) -> StaysIn {
    match count1.cmp(&count2) {
        Ordering::Greater => StaysIn::First,
        Ordering::Less => StaysIn::Second,
        Ordering::Equal => {
            if locale_cmp(name1, name2) != Ordering::Greater {
                StaysIn::First
            } else {
                StaysIn::Second
            }
        }
    }
}

/// Alphabetical comparison of display names, dictionary style.
///
/// Letters are compared first by base letter, then by accent, then by case
/// with lowercase ahead of uppercase. `ё` is `е` with a diaeresis, accented
/// Latin letters sort with their base letter, and Cyrillic letters outside
/// the Russian alphabet sort right after the letter they extend. Latin sorts
/// before Cyrillic. Names equal on every level fall back to code point order
/// so the order stays total.
pub fn locale_cmp(a: &str, b: &str) -> Ordering {
    let left = collation_elements(a);
    let right = collation_elements(b);

    let level = |pick: fn(&Element) -> u32| {
        left.iter().map(pick).cmp(right.iter().map(pick))
    };
    level(|e| e.primary)
        .then_with(|| level(|e| u32::from(e.accent)))
        .then_with(|| level(|e| u32::from(e.upper)))
        .then_with(|| a.cmp(b))
}

struct Element {
    primary: u32,
    accent: u8,
    upper: bool,
}

const ACUTE: u8 = 1;
const GRAVE: u8 = 2;
const BREVE: u8 = 3;
const CIRCUMFLEX: u8 = 4;
const CARON: u8 = 5;
const RING: u8 = 6;
const DIAERESIS: u8 = 7;
const TILDE: u8 = 8;
const DOT: u8 = 9;
const CEDILLA: u8 = 10;
const OGONEK: u8 = 11;
const STROKE: u8 = 12;

fn collation_elements(s: &str) -> Vec<Element> {
    s.chars()
        .flat_map(|c| {
            let upper = c.is_uppercase();
            c.to_lowercase().map(move |lower| {
                let (primary, accent) = letter_weight(lower);
                Element {
                    primary,
                    accent,
                    upper,
                }
            })
        })
        .collect()
}

fn primary(c: char) -> u32 {
    u32::from(c) << 4
}

/// Sorts between `c` and the next letter of its alphabet.
fn after(c: char) -> u32 {
    primary(c) + 1
}

/// Primary weight and accent mark of a lowercase letter.
fn letter_weight(c: char) -> (u32, u8) {
    let (base, accent) = match c {
        // Cyrillic
        'ё' => return (primary('е'), DIAERESIS),
        'є' => return (after('е'), 0),
        'ѓ' => return (primary('г'), ACUTE),
        'ґ' => return (after('г'), 0),
        'ђ' => return (after('д'), 0),
        'ѕ' => return (after('з'), 0),
        'і' => return (after('и'), 0),
        'ї' => return (after('и'), DIAERESIS),
        'ј' => return (after('й'), 0),
        'ќ' => return (primary('к'), ACUTE),
        'љ' => return (after('л'), 0),
        'њ' => return (after('н'), 0),
        'ћ' => return (after('т'), 0),
        'ў' => return (primary('у'), BREVE),
        'џ' => return (after('ч'), 0),

        // Latin
        'á' => ('a', ACUTE),
        'à' => ('a', GRAVE),
        'ă' => ('a', BREVE),
        'â' => ('a', CIRCUMFLEX),
        'å' => ('a', RING),
        'ä' => ('a', DIAERESIS),
        'ã' => ('a', TILDE),
        'ą' => ('a', OGONEK),
        'ç' => ('c', CEDILLA),
        'ć' => ('c', ACUTE),
        'č' => ('c', CARON),
        'ď' => ('d', CARON),
        'é' => ('e', ACUTE),
        'è' => ('e', GRAVE),
        'ê' => ('e', CIRCUMFLEX),
        'ě' => ('e', CARON),
        'ë' => ('e', DIAERESIS),
        'ė' => ('e', DOT),
        'ę' => ('e', OGONEK),
        'ğ' => ('g', BREVE),
        'í' => ('i', ACUTE),
        'ì' => ('i', GRAVE),
        'î' => ('i', CIRCUMFLEX),
        'ï' => ('i', DIAERESIS),
        'ł' => ('l', STROKE),
        'ń' => ('n', ACUTE),
        'ň' => ('n', CARON),
        'ñ' => ('n', TILDE),
        'ó' => ('o', ACUTE),
        'ò' => ('o', GRAVE),
        'ô' => ('o', CIRCUMFLEX),
        'ö' => ('o', DIAERESIS),
        'õ' => ('o', TILDE),
        'ø' => ('o', STROKE),
        'ř' => ('r', CARON),
        'ś' => ('s', ACUTE),
        'š' => ('s', CARON),
        'ş' => ('s', CEDILLA),
        'ť' => ('t', CARON),
        'ú' => ('u', ACUTE),
        'ù' => ('u', GRAVE),
        'û' => ('u', CIRCUMFLEX),
        'ů' => ('u', RING),
        'ü' => ('u', DIAERESIS),
        'ý' => ('y', ACUTE),
        'ÿ' => ('y', DIAERESIS),
        'ź' => ('z', ACUTE),
        'ž' => ('z', CARON),
        'ż' => ('z', DOT),
        other => (other, 0),
    };
    (primary(base), accent)
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Compute every overlapping pair of `snapshots` and who keeps each shared
/// phrase.
///
/// Snapshots with no phrases take no part. Entries in a pair are ordered by
/// combined volume, pairs by overlap size, both descending; ties keep input
/// order.
#[instrument(skip_all, fields(snapshots = snapshots.len()))]
pub fn resolve_all(snapshots: &[SubclusterSnapshot]) -> Vec<IntersectionPair> {
    let active: Vec<&SubclusterSnapshot> = snapshots
        .iter()
        .filter(|s| !s.filtered_queries.is_empty())
        .collect();

    let mut pairs = Vec::new();
    for (i, first) in active.iter().enumerate() {
        for second in &active[i + 1..] {
            if let Some(pair) = resolve_pair(first, second) {
                pairs.push(pair);
            }
        }
    }

    pairs.sort_by(|a, b| b.intersection_count.cmp(&a.intersection_count));

    info!(
        subclusters = active.len(),
        pairs = pairs.len(),
        "reconciliation resolved"
    );
    pairs
}

fn resolve_pair(
    first: &SubclusterSnapshot,
    second: &SubclusterSnapshot,
) -> Option<IntersectionPair> {
    let mut lookup: HashMap<String, &FrequencyRecord> =
        HashMap::with_capacity(second.filtered_queries.len());
    for record in &second.filtered_queries {
        lookup.entry(phrase_key(&record.phrase)).or_insert(record);
    }

    let mut intersection: Vec<IntersectionEntry> = first
        .filtered_queries
        .iter()
        .filter_map(|record| {
            let other = lookup.get(&phrase_key(&record.phrase))?;
            Some(IntersectionEntry {
                query: record.phrase.clone(),
                count1: record.count,
                count2: other.count,
                stays_in: stays_in(
                    record.count,
                    other.count,
                    &first.subcluster_name,
                    &second.subcluster_name,
                ),
            })
        })
        .collect();

    if intersection.is_empty() {
        return None;
    }

    intersection.sort_by(|a, b| {
        let weight_a = a.count1.saturating_add(a.count2);
        let weight_b = b.count1.saturating_add(b.count2);
        weight_b.cmp(&weight_a)
    });

    let remove_from1 = intersection
        .iter()
        .filter(|e| e.stays_in == StaysIn::Second)
        .count();

    Some(IntersectionPair {
        id1: first.subcluster_id.clone(),
        id2: second.subcluster_id.clone(),
        name1: first.subcluster_name.clone(),
        name2: second.subcluster_name.clone(),
        cluster1: first.cluster_name.clone(),
        cluster2: second.cluster_name.clone(),
        count1: first.filtered_queries.len(),
        count2: second.filtered_queries.len(),
        intersection_count: intersection.len(),
        remove_from1,
        remove_from2: intersection.len() - remove_from1,
        intersection,
    })
}

// ---------------------------------------------------------------------------
// Snapshot ingestion
// ---------------------------------------------------------------------------

/// Decode untyped snapshot documents, skipping the malformed ones.
pub fn parse_snapshots(values: Vec<serde_json::Value>) -> Vec<SubclusterSnapshot> {
    values
        .into_iter()
        .filter_map(|value| match SubclusterSnapshot::from_value(value) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(error = %e, "skipping snapshot");
                None
            }
        })
        .collect()
}

/// Decode a JSON array of snapshot documents. The array itself must be well
/// formed; its elements are decoded leniently.
pub fn parse_snapshot_document(json: &str) -> Result<Vec<SubclusterSnapshot>> {
    let values: Vec<serde_json::Value> = serde_json::from_str(json).map_err(|e| {
        KwEngineError::validation(format!("expected a JSON array of snapshots: {e}"))
    })?;
    Ok(parse_snapshots(values))
}

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

/// Recompute reconciliation from every stored snapshot and replace the cache.
pub async fn reconcile(storage: &Storage) -> Result<ReconciliationDocument> {
    let snapshots = storage.list_snapshots().await?;
    let document = ReconciliationDocument {
        last_updated: Some(Utc::now()),
        pairs: resolve_all(&snapshots),
    };
    storage.write_reconciliation(&document).await?;
    Ok(document)
}

/// The last persisted reconciliation, serialized exactly as it was stored.
/// Never recomputes.
pub async fn cached_json(storage: &Storage) -> Result<String> {
    match storage.read_reconciliation_json().await? {
        Some(json) => Ok(json),
        None => serde_json::to_string(&ReconciliationDocument::empty())
            .map_err(|e| KwEngineError::Storage(e.to_string())),
    }
}

/// Plain-text rendering of `document` for terminals: one header line per
/// pair, then one line per shared phrase naming the side that keeps it.
pub fn summary(document: &ReconciliationDocument) -> String {
    let mut out = String::new();
    match document.last_updated {
        Some(at) => out.push_str(&format!("Updated {}\n", at.to_rfc3339())),
        None => out.push_str("Never computed\n"),
    }
    if document.pairs.is_empty() {
        out.push_str("No overlapping subclusters.\n");
        return out;
    }
    for pair in &document.pairs {
        out.push_str(&format!(
            "\n[1] {} / [2] {}: {} shared, remove {} from [1], {} from [2]\n",
            pair.name1, pair.name2, pair.intersection_count, pair.remove_from1, pair.remove_from2
        ));
        for entry in &pair.intersection {
            out.push_str(&format!(
                "  {:<40} {:>10} {:>10}  -> [{}]\n",
                entry.query, entry.count1, entry.count2, entry.stays_in
            ));
        }
    }
    out
}
