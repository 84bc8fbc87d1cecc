use crate::config::{TransferConfig, TransferModeSetting};
use crate::core_ftpcommand::TransferType;
use log::warn;
use regex::Regex;

/// Chooses ASCII or binary transfer mode for a file name.
#[derive(Debug, Clone)]
pub struct TransferModeClassifier {
    setting: TransferModeSetting,
    ascii_masks: Option<Regex>,
}

/// Turns `*.txt;readme.*` style masks into one anchored, case-insensitive regex.
fn masks_to_regex(masks: &str) -> Option<Regex> {
    let alternatives: Vec<String> = masks
        .split(|c| c == ';' || c == ',')
        .map(str::trim)
        .filter(|mask| !mask.is_empty())
        .map(|mask| {
            regex::escape(mask)
                .replace(r"\*", ".*")
                .replace(r"\?", ".")
        })
        .collect();
    if alternatives.is_empty() {
        return None;
    }
    let pattern = format!("(?i)^(?:{})$", alternatives.join("|"));
    match Regex::new(&pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!("Ignoring ASCII masks '{}': {}", masks, e);
            None
        }
    }
}

impl TransferModeClassifier {
    pub fn new(setting: TransferModeSetting, ascii_masks: &str) -> Self {
        Self {
            setting,
            ascii_masks: masks_to_regex(ascii_masks),
        }
    }

    pub fn from_config(config: &TransferConfig) -> Self {
        Self::new(config.transfer_mode, &config.ascii_masks)
    }

    pub fn is_ascii(&self, name: &str) -> bool {
        match self.setting {
            TransferModeSetting::Ascii => true,
            TransferModeSetting::Binary => false,
            TransferModeSetting::Auto => self
                .ascii_masks
                .as_ref()
                .map_or(false, |re| re.is_match(name)),
        }
    }

    pub fn transfer_type(&self, name: &str) -> TransferType {
        if self.is_ascii(name) {
            TransferType::Ascii
        } else {
            TransferType::Binary
        }
    }
}
