//! Candidate filters for the mirror and extract workflows.
//!
//! Filters decide which artifacts a worker picks up; ordering makes the
//! newest releases land in the mirror and symbol store first.

use chrono::{Datelike, NaiveDate};

use crate::ipsw::IpswArtifact;

/// Artifacts eligible for mirroring: released in the current or previous
/// calendar year, with at least one source still waiting to be mirrored.
/// Undated artifacts are excluded -- AppleDB backfills the date quickly
/// and the mirror window is what bounds our storage bill.
pub fn mirror_filter<'a, I>(artifacts: I, today: NaiveDate) -> Vec<&'a IpswArtifact>
where
    I: IntoIterator<Item = &'a IpswArtifact>,
{
    let mut candidates: Vec<&IpswArtifact> = artifacts
        .into_iter()
        .filter(|artifact| {
            artifact
                .released
                .is_some_and(|released| released.year() >= today.year() - 1)
                && artifact.any_source(|state| state.is_mirrorable())
        })
        .collect();
    sort_newest_first(&mut candidates);
    candidates
}

/// Artifacts eligible for extraction: at least one mirrored source.
pub fn extract_filter<'a, I>(artifacts: I) -> Vec<&'a IpswArtifact>
where
    I: IntoIterator<Item = &'a IpswArtifact>,
{
    let mut candidates: Vec<&IpswArtifact> = artifacts
        .into_iter()
        .filter(|artifact| artifact.any_source(|state| state.is_extractable()))
        .collect();
    sort_newest_first(&mut candidates);
    candidates
}

/// Order candidates by release date, newest first; undated records last.
fn sort_newest_first(candidates: &mut [&IpswArtifact]) {
    candidates.sort_by(|a, b| match (a.released, b.released) {
        (Some(a_date), Some(b_date)) => b_date.cmp(&a_date),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::*;
    use crate::ipsw::{IpswPlatform, IpswReleaseStatus, IpswSource};
    use crate::state::ArtifactProcessingState;

    fn make_source(state: ArtifactProcessingState) -> IpswSource {
        IpswSource {
            devices: vec!["iPhone14,7".into()],
            link: Url::parse("https://example.com/test.ipsw").unwrap(),
            hashes: None,
            size: None,
            processing_state: state,
            mirror_path: None,
            last_run: 0,
        }
    }

    fn make_artifact(released: Option<NaiveDate>, sources: Vec<IpswSource>) -> IpswArtifact {
        IpswArtifact {
            platform: IpswPlatform::Ios,
            version: "17.0".into(),
            build: "21A100".into(),
            released,
            release_status: IpswReleaseStatus::Release,
            sources,
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 15).unwrap()
    }

    #[test]
    fn mirror_filter_includes_indexed_from_current_year() {
        let artifact = make_artifact(
            NaiveDate::from_ymd_opt(2024, 3, 1),
            vec![make_source(ArtifactProcessingState::Indexed)],
        );
        assert_eq!(mirror_filter([&artifact], today()), vec![&artifact]);
    }

    #[test]
    fn mirror_filter_includes_indexed_from_previous_year() {
        let artifact = make_artifact(
            NaiveDate::from_ymd_opt(2023, 12, 1),
            vec![make_source(ArtifactProcessingState::Indexed)],
        );
        assert_eq!(mirror_filter([&artifact], today()).len(), 1);
    }

    #[test]
    fn mirror_filter_excludes_already_mirrored() {
        let artifact = make_artifact(
            NaiveDate::from_ymd_opt(2024, 3, 1),
            vec![make_source(ArtifactProcessingState::Mirrored)],
        );
        assert!(mirror_filter([&artifact], today()).is_empty());
    }

    #[test]
    fn mirror_filter_excludes_old_artifacts() {
        let artifact = make_artifact(
            NaiveDate::from_ymd_opt(2022, 6, 15),
            vec![make_source(ArtifactProcessingState::Indexed)],
        );
        assert!(mirror_filter([&artifact], today()).is_empty());
    }

    #[test]
    fn mirror_filter_excludes_undated_artifacts() {
        let artifact = make_artifact(None, vec![make_source(ArtifactProcessingState::Indexed)]);
        assert!(mirror_filter([&artifact], today()).is_empty());
    }

    #[test]
    fn mirror_filter_includes_if_any_source_indexed() {
        let artifact = make_artifact(
            NaiveDate::from_ymd_opt(2024, 3, 1),
            vec![
                make_source(ArtifactProcessingState::Mirrored),
                make_source(ArtifactProcessingState::Indexed),
            ],
        );
        assert_eq!(mirror_filter([&artifact], today()).len(), 1);
    }

    #[test]
    fn extract_filter_includes_mirrored_artifact() {
        let artifact = make_artifact(None, vec![make_source(ArtifactProcessingState::Mirrored)]);
        assert_eq!(extract_filter([&artifact]), vec![&artifact]);
    }

    #[test]
    fn extract_filter_excludes_indexed_and_extracted() {
        let indexed = make_artifact(None, vec![make_source(ArtifactProcessingState::Indexed)]);
        let done = make_artifact(
            None,
            vec![make_source(ArtifactProcessingState::SymbolsExtracted)],
        );
        assert!(extract_filter([&indexed, &done]).is_empty());
    }

    #[test]
    fn extract_filter_includes_if_any_source_mirrored() {
        let artifact = make_artifact(
            None,
            vec![
                make_source(ArtifactProcessingState::SymbolsExtracted),
                make_source(ArtifactProcessingState::Mirrored),
            ],
        );
        assert_eq!(extract_filter([&artifact]).len(), 1);
    }

    #[test]
    fn candidates_are_ordered_newest_first_undated_last() {
        let old = make_artifact(
            NaiveDate::from_ymd_opt(2024, 1, 1),
            vec![make_source(ArtifactProcessingState::Mirrored)],
        );
        let new = make_artifact(
            NaiveDate::from_ymd_opt(2024, 5, 1),
            vec![make_source(ArtifactProcessingState::Mirrored)],
        );
        let undated = make_artifact(None, vec![make_source(ArtifactProcessingState::Mirrored)]);

        let ordered = extract_filter([&old, &undated, &new]);
        assert_eq!(
            ordered.iter().map(|a| a.released).collect::<Vec<_>>(),
            vec![
                NaiveDate::from_ymd_opt(2024, 5, 1),
                NaiveDate::from_ymd_opt(2024, 1, 1),
                None
            ]
        );
    }
}
