use serde::{Deserialize, Serialize};

/// Default embedding length produced by the extraction sidecar.
pub const EMBEDDING_DIM: usize = 128;

/// Default maximum Euclidean distance for two embeddings to be the same person.
pub const DEFAULT_TOLERANCE: f64 = 0.45;

/// Row id of a registered student.
pub type StudentId = i64;

/// Face embedding vector (128-dimensional for the reference extractor).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f64>,
}

impl Embedding {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f64 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f64>()
            .sqrt()
    }

    /// Serialize as little-endian `f64` components, the on-disk blob format.
    pub fn to_blob(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Parse a blob written by [`to_blob`](Self::to_blob).
    ///
    /// Returns `None` if the blob length is not a whole number of components.
    pub fn from_blob(blob: &[u8]) -> Option<Self> {
        if blob.is_empty() || blob.len() % 8 != 0 {
            return None;
        }
        let values = blob
            .chunks_exact(8)
            .map(|chunk| {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(chunk);
                f64::from_le_bytes(bytes)
            })
            .collect();
        Some(Self { values })
    }
}

/// Attendance action requested by the person in front of the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Login,
    Logout,
}

impl Action {
    /// Parse the wire name (`"login"` / `"logout"`).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "login" => Some(Action::Login),
            "logout" => Some(Action::Logout),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Login => "login",
            Action::Logout => "logout",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical session state of a student, also the status of attendance rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    LoggedIn,
    LoggedOut,
}

impl AttendanceStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "logged_in" => Some(AttendanceStatus::LoggedIn),
            "logged_out" => Some(AttendanceStatus::LoggedOut),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::LoggedIn => "logged_in",
            AttendanceStatus::LoggedOut => "logged_out",
        }
    }
}

/// A registered student.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    pub id: StudentId,
    pub name: String,
    pub class: String,
}

/// A student together with the embedding captured at registration.
#[derive(Debug, Clone)]
pub struct EnrolledFace {
    pub student: Student,
    pub embedding: Embedding,
}

/// Result of matching a probe embedding against the enrolled gallery.
#[derive(Debug, Clone)]
pub struct MatchResult {
    /// The matched student, if the best distance is within tolerance.
    pub student: Option<Student>,
    /// Distance to the closest enrolled face (`None` for an empty gallery).
    pub distance: Option<f64>,
}

impl MatchResult {
    pub fn matched(&self) -> bool {
        self.student.is_some()
    }
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
///
/// The linear [`EuclideanMatcher`] is fine for a classroom-sized gallery; an
/// approximate index can be swapped in behind the same trait.
pub trait Matcher {
    fn best_match(&self, probe: &Embedding, gallery: &[EnrolledFace]) -> MatchResult;
}

/// Nearest-neighbour matcher over Euclidean distance.
pub struct EuclideanMatcher {
    /// Matches are accepted only when the best distance is strictly below this.
    pub tolerance: f64,
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

impl Matcher for EuclideanMatcher {
    fn best_match(&self, probe: &Embedding, gallery: &[EnrolledFace]) -> MatchResult {
        let mut best_dist = f64::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, face) in gallery.iter().enumerate() {
            if face.embedding.dim() != probe.dim() {
                tracing::warn!(
                    student_id = face.student.id,
                    enrolled = face.embedding.dim(),
                    probe = probe.dim(),
                    "skipping enrolled face with mismatched dimension"
                );
                continue;
            }
            // Strict comparison keeps the first of equally close faces.
            let dist = probe.euclidean_distance(&face.embedding);
            if dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_dist < self.tolerance => MatchResult {
                student: Some(gallery[idx].student.clone()),
                distance: Some(best_dist),
            },
            Some(_) => MatchResult {
                student: None,
                distance: Some(best_dist),
            },
            None => MatchResult {
                student: None,
                distance: None,
            },
        }
    }
}
