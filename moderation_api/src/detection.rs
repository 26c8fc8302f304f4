/// One model output for a single image. Region is `[x, y, width, height]` in source pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub region: [f32; 4],
}

#[cfg(test)]
impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence,
            region: [0.0; 4],
        }
    }
}
