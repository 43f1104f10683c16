use serde::{Deserialize, Serialize};

/// Processing state of a single artifact source.
///
/// Every OTA artifact and every IPSW source advances along this machine:
///
/// ```text
/// INDEXED -> MIRRORED -> SYMBOLS_EXTRACTED
/// ```
///
/// with side exits into duplicate/invalid/failed states. Workers never move
/// a source backwards; error states are only reset by an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactProcessingState {
    /// Freshly indexed from Apple or AppleDB, not yet mirrored.
    #[default]
    Indexed,
    /// Payload-identical to another indexed artifact (e.g. beta == GA).
    IndexedDuplicate,
    /// Indexing produced a record we could not act on (bad URL, dead link).
    IndexedInvalid,
    /// Manually excluded by an operator.
    Ignored,
    /// Download or post-download verification failed during mirroring.
    MirroringFailed,
    /// Uploaded to the mirror namespace and recorded in metadata.
    Mirrored,
    /// The mirror blob disappeared or no longer matches its recorded hash.
    MirrorCorrupt,
    /// No `dyld_shared_cache` could be located in the artifact.
    DscExtractionFailed,
    /// The extraction toolchain failed after a DSC was located.
    SymbolExtractionFailed,
    /// Symbols uploaded to the symbol store; nothing left to do.
    SymbolsExtracted,
    /// Extraction succeeded but the bundle index already existed.
    BundleDuplicationDetected,
}

impl ArtifactProcessingState {
    /// States that no worker will pick up again in any run.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::SymbolsExtracted | Self::IndexedDuplicate | Self::IndexedInvalid | Self::Ignored
        )
    }

    /// Whether the mirror stage should process a source in this state.
    pub fn is_mirrorable(self) -> bool {
        self == Self::Indexed
    }

    /// Whether the extract stage should process a source in this state.
    pub fn is_extractable(self) -> bool {
        self == Self::Mirrored
    }

    /// Position along the happy path. Used to assert that successive runs
    /// never regress a source (error states share the rank of the stage
    /// they were reached from).
    pub fn rank(self) -> u8 {
        match self {
            Self::Indexed => 0,
            Self::IndexedDuplicate | Self::IndexedInvalid | Self::Ignored => 1,
            Self::MirroringFailed => 1,
            Self::Mirrored | Self::MirrorCorrupt => 2,
            Self::DscExtractionFailed
            | Self::SymbolExtractionFailed
            | Self::BundleDuplicationDetected => 3,
            Self::SymbolsExtracted => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_snake_case() {
        let json = serde_json::to_string(&ArtifactProcessingState::SymbolsExtracted).unwrap();
        assert_eq!(json, "\"symbols_extracted\"");
        let json = serde_json::to_string(&ArtifactProcessingState::IndexedDuplicate).unwrap();
        assert_eq!(json, "\"indexed_duplicate\"");
    }

    #[test]
    fn round_trips_all_states() {
        for state in [
            ArtifactProcessingState::Indexed,
            ArtifactProcessingState::IndexedDuplicate,
            ArtifactProcessingState::IndexedInvalid,
            ArtifactProcessingState::Ignored,
            ArtifactProcessingState::MirroringFailed,
            ArtifactProcessingState::Mirrored,
            ArtifactProcessingState::MirrorCorrupt,
            ArtifactProcessingState::DscExtractionFailed,
            ArtifactProcessingState::SymbolExtractionFailed,
            ArtifactProcessingState::SymbolsExtracted,
            ArtifactProcessingState::BundleDuplicationDetected,
        ] {
            let json = serde_json::to_string(&state).unwrap();
            let back: ArtifactProcessingState = serde_json::from_str(&json).unwrap();
            assert_eq!(back, state);
        }
    }

    #[test]
    fn default_is_indexed() {
        assert_eq!(
            ArtifactProcessingState::default(),
            ArtifactProcessingState::Indexed
        );
    }

    #[test]
    fn terminal_states() {
        assert!(ArtifactProcessingState::SymbolsExtracted.is_terminal());
        assert!(ArtifactProcessingState::IndexedDuplicate.is_terminal());
        assert!(ArtifactProcessingState::Ignored.is_terminal());
        assert!(!ArtifactProcessingState::MirroringFailed.is_terminal());
        assert!(!ArtifactProcessingState::Mirrored.is_terminal());
    }

    #[test]
    fn happy_path_ranks_increase() {
        assert!(
            ArtifactProcessingState::Indexed.rank() < ArtifactProcessingState::Mirrored.rank()
        );
        assert!(
            ArtifactProcessingState::Mirrored.rank()
                < ArtifactProcessingState::SymbolsExtracted.rank()
        );
    }
}
