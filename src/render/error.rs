//! Template-aware conversion of handler errors into responses.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::json;
use tracing::{error, warn};

use super::{Data, Options, RenderConfig};
use crate::app::ErrorHandler;
use crate::context::Context;
use crate::error::Error;
use crate::http::{Method, StatusCode};

/// Turns an error into a response, preferring an error template.
///
/// - A committed response is left alone; the error is only logged.
/// - The status comes from an [`HttpError`](crate::HttpError), otherwise
///   [`Options::default_error_http_code`].
/// - The message is the error text in debug mode, otherwise the
///   `HttpError` message or the status title.
/// - `HEAD` requests get the status only.
/// - With a renderer installed, the template registered for the status (or
///   [`Options::default_error_tmpl`]) is output with a [`Data`] envelope whose
///   `Info` holds `title`, `content`, `code` and `debug`.
/// - Without a template, or if output fails, the message is written as plain
///   text; a render failure is appended to it.
#[derive(Clone, Default)]
pub struct HttpErrorHandler {
    templates: HashMap<u16, String>,
    options: Options,
}

impl HttpErrorHandler {
    pub fn new(options: Options) -> Self {
        Self {
            templates: HashMap::new(),
            options,
        }
    }

    /// Options plus the per-status templates from `config.error_templates`.
    /// Keys that are not status numbers are logged and ignored.
    pub fn from_config(config: &RenderConfig) -> Self {
        let mut handler = Self::new(Options::from_config(config));
        for (code, tmpl) in &config.error_templates {
            match code.parse::<u16>() {
                Ok(code) => {
                    handler.templates.insert(code, tmpl.clone());
                }
                Err(_) => warn!(key = %code, "error template key is not a status code"),
            }
        }
        handler
    }

    /// Registers `tmpl` for responses with status `code`.
    #[must_use]
    pub fn template(mut self, code: StatusCode, tmpl: impl Into<String>) -> Self {
        self.templates.insert(code.as_u16(), tmpl.into());
        self
    }

    fn template_for(&self, code: StatusCode) -> Option<&str> {
        self.templates
            .get(&code.as_u16())
            .map(String::as_str)
            .or_else(|| Some(self.options.default_error_tmpl.as_str()))
            .filter(|tmpl| !tmpl.is_empty())
    }
}

#[async_trait]
impl ErrorHandler for HttpErrorHandler {
    async fn handle(&self, err: Error, ctx: &mut Context) {
        if ctx.committed() {
            error!(error = %err, path = %ctx.path(), "error after response was committed");
            return;
        }

        let (code, mut message) = match err.as_http() {
            Some(http) => (http.code(), http.message().to_owned()),
            None => (self.options.default_error_http_code, String::new()),
        };
        let title = code.canonical_reason();
        if ctx.debug() {
            message = err.to_string();
        } else if message.is_empty() {
            message = title.to_owned();
        }
        if code.as_u16() >= 500 {
            error!(error = %err, status = code.as_u16(), path = %ctx.path(), "request failed");
        } else {
            warn!(error = %err, status = code.as_u16(), path = %ctx.path(), "request failed");
        }

        if *ctx.method() == Method::Head {
            if let Err(e) = ctx.no_content(code).await {
                error!(error = %e, "failed to write error status");
            }
            return;
        }

        if ctx.renderer().is_some() {
            if let Some(tmpl) = self.template_for(code) {
                let info = json!({
                    "title": title,
                    "content": message,
                    "code": code.as_u16(),
                    "debug": ctx.debug(),
                });
                ctx.set(self.options.tmpl_key.clone(), tmpl);
                ctx.set(self.options.data_key.clone(), Data::default().with_info(info).with_code(code.as_u16()));
                ctx.set_code(code);

                let format = ctx.format();
                match self.options.output.output(&format, ctx, &self.options).await {
                    Ok(()) => return,
                    Err(render_err) => {
                        error!(error = %render_err, template = tmpl, "error template failed");
                        message.push('\n');
                        message.push_str(&render_err.to_string());
                    }
                }
                if ctx.committed() {
                    return;
                }
            }
        }

        if let Err(e) = ctx.string(code, message).await {
            error!(error = %e, "failed to write error response");
        }
    }
}
