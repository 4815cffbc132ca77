use super::constants::*;

pub(crate) fn log_level() -> Option<String> {
    Some("info".to_string())
}

pub(crate) fn log_file_path() -> String {
    LOG_FILE_PATH.to_string()
}

pub(crate) fn db_file_path() -> Option<String> {
    Some(DB_FILE_PATH.to_string())
}

pub(crate) fn busy_timeout_ms() -> u64 {
    BUSY_TIMEOUT_MS
}

pub(crate) fn default_true() -> bool {
    true
}

pub(crate) fn endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

pub(crate) fn model() -> String {
    DEFAULT_MODEL.to_string()
}

pub(crate) fn max_output_tokens() -> Option<usize> {
    Some(MAX_OUTPUT_TOKENS)
}

pub(crate) fn temperature() -> Option<f32> {
    Some(TEMPERATURE)
}
