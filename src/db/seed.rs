use anyhow::Result;
use sqlx::SqlitePool;

use crate::models::{AlternateNames, TeamOverride};

fn opt(name: &str) -> Option<String> {
    (!name.is_empty()).then(|| name.to_string())
}

/// Known spelling mismatches between the rating provider and the schedule and
/// odds feeds. Operators can change any of these later via `override set`.
pub async fn seed_default_overrides(pool: &SqlitePool) -> Result<()> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM team_overrides")
        .fetch_one(pool)
        .await?;

    if count > 0 {
        tracing::info!("Overrides already present ({} rows), skipping defaults.", count);
        return Ok(());
    }

    // (source name, canonical, espn, odds api, sbr)
    let defaults: Vec<(&str, &str, &str, &str, &str)> = vec![
        ("Connecticut",     "UConn",            "UConn Huskies",                "UConn Huskies",               "Connecticut"),
        ("Saint Mary's",    "Saint Mary's",     "Saint Mary's Gaels",           "Saint Mary's Gaels",          "St. Mary's"),
        ("Miami FL",        "Miami (FL)",       "Miami Hurricanes",             "Miami Hurricanes",            "Miami Florida"),
        ("Miami OH",        "Miami (OH)",       "Miami (OH) RedHawks",          "Miami (OH) RedHawks",         "Miami Ohio"),
        ("N.C. State",      "NC State",         "NC State Wolfpack",            "North Carolina St Wolfpack",  "North Carolina State"),
        ("Mississippi",     "Ole Miss",         "Ole Miss Rebels",              "Ole Miss Rebels",             "Mississippi"),
        ("Louisiana St.",   "LSU",              "LSU Tigers",                   "LSU Tigers",                  "LSU"),
        ("Southern California", "USC",          "USC Trojans",                  "USC Trojans",                 "Southern California"),
        ("St. John's",      "St. John's",       "St. John's Red Storm",         "St. John's Red Storm",        "St. John's"),
        ("Texas A&M Corpus Chris", "Texas A&M-Corpus Christi", "Texas A&M-CC Islanders", "Texas A&M-CC Islanders", ""),
        ("UNC Wilmington",  "UNC Wilmington",   "UNC Wilmington Seahawks",      "UNC Wilmington Seahawks",     "NC Wilmington"),
        ("Loyola Chicago",  "Loyola Chicago",   "Loyola Chicago Ramblers",      "Loyola (Chi) Ramblers",       "Loyola Illinois"),
    ];

    for (source, canonical, espn, odds_api, sbr) in &defaults {
        let ov = TeamOverride {
            source_name: source.to_string(),
            canonical_name: canonical.to_string(),
            alternates: AlternateNames {
                espn_name: opt(espn),
                odds_api_name: opt(odds_api),
                sbr_name: opt(sbr),
            },
        };
        super::upsert_override(pool, &ov).await?;
    }

    tracing::info!("Seeded {} default team overrides", defaults.len());
    Ok(())
}
