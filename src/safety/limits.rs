use super::{SafetyClassifier, SafetyInput, Verdict};

/// Rejects uploads that are too large in bytes or declare oversized
/// dimensions. Captions always pass.
pub struct LimitsClassifier {
    max_bytes: usize,
    max_dimension: u32,
}

impl LimitsClassifier {
    pub fn new(max_bytes: usize, max_dimension: u32) -> Self {
        Self {
            max_bytes,
            max_dimension,
        }
    }

    fn reason(&self) -> String {
        format!(
            "Image must be less than {} and dimensions must not exceed {}x{}",
            human_size(self.max_bytes),
            self.max_dimension,
            self.max_dimension
        )
    }
}

fn human_size(bytes: usize) -> String {
    const KIB: usize = 1024;
    const MIB: usize = 1024 * 1024;
    if bytes >= MIB && bytes % MIB == 0 {
        format!("{}MB", bytes / MIB)
    } else if bytes >= MIB {
        format!("{:.1}MB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{}KB", bytes / KIB)
    } else {
        format!("{} bytes", bytes)
    }
}

#[async_trait::async_trait]
impl SafetyClassifier for LimitsClassifier {
    fn name(&self) -> &str {
        "limits"
    }

    async fn classify(&self, input: SafetyInput<'_>) -> Verdict {
        let SafetyInput::Image(upload) = input else {
            return Verdict::Allowed;
        };
        if upload.len() > self.max_bytes {
            return Verdict::Rejected(self.reason());
        }
        match upload.dimensions() {
            Some((w, h)) if w > self.max_dimension || h > self.max_dimension => {
                Verdict::Rejected(self.reason())
            }
            Some((0, _)) | Some((_, 0)) => {
                Verdict::Rejected("Image header declares zero width or height".into())
            }
            _ => Verdict::Allowed,
        }
    }
}
