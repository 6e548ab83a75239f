//! Console encoder that renders a record's key-value pairs after its message.
//!
//! `warn!(attempt = 2, node:% = url; "Node request failed")` is printed as
//! `<pattern output> attempt=2 node=http://...`. Values containing whitespace
//! are quoted so the line stays machine-splittable.

use std::io;

use log::{
    Record,
    kv::{Error, Key, Value, VisitSource},
};
use log4rs::encode::pattern::PatternEncoder;
use log4rs::encode::{Color, Encode, Style, Write};
use serde::Deserialize;

const DEFAULT_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} {h({l:<5})} {t} {m}";

#[derive(Debug, Deserialize)]
pub struct StructuredConsoleEncoderConfig {
    pub pattern: Option<String>,
}

#[derive(Debug)]
pub struct StructuredConsoleEncoder {
    message: PatternEncoder,
}

impl StructuredConsoleEncoder {
    pub fn new(pattern: &str) -> Self {
        Self {
            message: PatternEncoder::new(pattern),
        }
    }
}

impl Encode for StructuredConsoleEncoder {
    fn encode(&self, w: &mut dyn Write, record: &Record) -> anyhow::Result<()> {
        self.message.encode(w, record)?;

        let mut fields = FieldWriter {
            out: &mut *w,
            failure: None,
        };
        if let Err(kv_err) = record.key_values().visit(&mut fields) {
            match fields.failure {
                Some(io_err) => return Err(io_err.into()),
                None => write!(w, " [invalid fields: {}]", kv_err)?,
            }
        }

        w.write_all(b"\n")?;
        Ok(())
    }
}

struct FieldWriter<'a> {
    out: &'a mut dyn Write,
    failure: Option<io::Error>,
}

impl FieldWriter<'_> {
    fn write_field(&mut self, key: &Key<'_>, value: &Value<'_>) -> io::Result<()> {
        self.out.set_style(Style::new().text(Color::Blue))?;
        write!(self.out, " {}", key)?;
        self.out.set_style(&Style::default())?;

        let rendered = value.to_string();
        if rendered.chars().any(char::is_whitespace) {
            write!(self.out, "={:?}", rendered)
        } else {
            write!(self.out, "={}", rendered)
        }
    }
}

impl<'kvs> VisitSource<'kvs> for FieldWriter<'_> {
    fn visit_pair(&mut self, key: Key<'kvs>, value: Value<'kvs>) -> Result<(), Error> {
        if let Err(e) = self.write_field(&key, &value) {
            self.failure = Some(e);
            return Err(Error::msg("failed to write log field"));
        }
        Ok(())
    }
}

pub struct StructuredConsoleEncoderDeserializer;

impl log4rs::config::Deserialize for StructuredConsoleEncoderDeserializer {
    type Trait = dyn Encode;
    type Config = StructuredConsoleEncoderConfig;

    fn deserialize(
        &self,
        config: StructuredConsoleEncoderConfig,
        _: &log4rs::config::Deserializers,
    ) -> anyhow::Result<Box<dyn Encode>> {
        let pattern = config.pattern.as_deref().unwrap_or(DEFAULT_PATTERN);
        Ok(Box::new(StructuredConsoleEncoder::new(pattern)))
    }
}
