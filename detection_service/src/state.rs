use crate::config::{LabelsConfig, Validatable};
use std::{
    fs::File,
    io::{self, BufRead},
    path::Path,
};

pub trait State: Send + Sync + 'static {
    fn new(labels_cfg: &LabelsConfig) -> Result<Self, String>
    where
        Self: Sized;
    fn get_labels(&self) -> &Vec<String>;
}

#[derive(Debug)]
pub struct ServiceState {
    class_labels: Vec<String>,
}

impl State for ServiceState {
    fn new(labels_cfg: &LabelsConfig) -> Result<ServiceState, String> {
        match load_labels(&labels_cfg.get_path()) {
            Ok(labels) => Ok(ServiceState {
                class_labels: labels,
            }),
            Err(e) => Err(format!("Failed to load labels: {}", e)),
        }
    }

    fn get_labels(&self) -> &Vec<String> {
        &self.class_labels
    }
}

/// Reads one class label per line; the line index is the model's class id.
pub fn load_labels(filepath: &Path) -> io::Result<Vec<String>> {
    let file = File::open(filepath)?;
    let reader = io::BufReader::new(file);
    let mut labels = Vec::new();

    for line_result in reader.lines() {
        let line = line_result?;
        let label = line.trim();
        if label.is_empty() {
            continue;
        }
        if label.contains(char::is_whitespace) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid label: {}", label),
            ));
        }
        labels.push(label.to_string());
    }

    Ok(labels)
}
