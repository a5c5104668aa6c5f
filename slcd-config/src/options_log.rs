//! Human-readable log of the active options.

use crate::{common::*, settings::Settings};
use serde_json::Value;

pub const OPTIONS_HEADER: &str = "------------ Options -------------";
pub const OPTIONS_FOOTER: &str = "-------------- End ----------------";

impl Settings {
    /// List every option and derived value in declaration order.
    ///
    /// Option groups are flattened into dotted keys, e.g. `dataset.image_size`.
    /// Derived values keep their bare names, e.g. `width` and `viz_dir`.
    pub fn entries(&self) -> Result<IndexMap<String, String>> {
        let value = serde_json::to_value(self).context("failed to serialize settings")?;
        let mut entries = IndexMap::new();
        flatten_value("", &value, &mut entries);
        Ok(entries)
    }

    /// Append the options to the log file in the weight directory.
    pub fn log_configs(&self) -> Result<()> {
        write_options_log(self.log_path(), &self.entries()?)
    }
}

/// Append a block of `key: value` lines to the file, creating it if missing.
pub fn write_options_log<P>(path: P, entries: &IndexMap<String, String>) -> Result<()>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file '{}'", path.display()))?;
    let mut writer = io::BufWriter::new(file);

    let lines = iter::once(OPTIONS_HEADER.to_string())
        .chain(
            entries
                .iter()
                .map(|(key, value)| format!("{}: {}", key, value)),
        )
        .chain(iter::once(OPTIONS_FOOTER.to_string()));

    for line in lines {
        writeln!(writer, "{}", line)
            .with_context(|| format!("failed to write log file '{}'", path.display()))?;
        info!("{}", line);
    }
    writer
        .flush()
        .with_context(|| format!("failed to write log file '{}'", path.display()))?;

    Ok(())
}

fn flatten_value(prefix: &str, value: &Value, entries: &mut IndexMap<String, String>) {
    match value {
        Value::Object(map) => {
            map.iter().for_each(|(key, value)| {
                let key = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten_value(&key, value, entries);
            });
        }
        other => {
            entries.insert(prefix.to_string(), render_value(other));
        }
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => "null".into(),
        Value::String(text) => text.clone(),
        Value::Array(items) => format!("[{}]", items.iter().map(render_value).join(", ")),
        other => other.to_string(),
    }
}
