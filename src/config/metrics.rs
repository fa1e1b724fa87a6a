use hyper::StatusCode;
use tracing::debug;

/// One meter compiled from a metrics-spec token.
///
/// The spec grammar is a comma separated list of tokens, each one of:
/// `size` (response size histogram), `DDD` (exact status code counter) or
/// `DXX`/`Dxx` (status class counter). Unrecognized tokens are skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Meter {
    /// Histogram `<handler>.resp-size`
    Size { metric: String },
    /// Counter `<handler>.code.<DDD>` incremented on an exact status match
    ExactCode { code: u16, metric: String },
    /// Counter `<handler>.code.<DXX>` incremented when the status is in class
    ClassCode { class: u16, metric: String },
}

impl Meter {
    /// Record a finished response against this meter
    pub fn measure(&self, status: StatusCode, resp_size: u64) {
        match self {
            Meter::Size { metric } => {
                metrics::histogram!(metric.clone()).record(resp_size as f64);
            }
            Meter::ExactCode { code, metric } => {
                if status.as_u16() == *code {
                    metrics::counter!(metric.clone()).increment(1);
                }
            }
            Meter::ClassCode { class, metric } => {
                let diff = status.as_u16() as i32 - *class as i32;
                if (0..100).contains(&diff) {
                    metrics::counter!(metric.clone()).increment(1);
                }
            }
        }
    }
}

fn is_exact_token(tok: &str) -> bool {
    tok.len() == 3 && tok.bytes().all(|b| b.is_ascii_digit())
}

fn is_class_token(tok: &str) -> bool {
    let b = tok.as_bytes();
    tok.len() == 3
        && b[0].is_ascii_digit()
        && (b[1] == b'x' || b[1] == b'X')
        && (b[2] == b'x' || b[2] == b'X')
}

/// Compile a metrics spec string into meters for the named handler
pub fn parse_metrics_spec(handler_name: &str, spec: &str) -> Vec<Meter> {
    let mut meters = Vec::new();
    for tok in spec.split(',') {
        let tok = tok.trim();
        if tok == "size" {
            debug!(handler = handler_name, "creating size metric");
            meters.push(Meter::Size {
                metric: format!("{}.resp-size", handler_name),
            });
        } else if is_exact_token(tok) {
            debug!(handler = handler_name, code = tok, "creating status metric");
            meters.push(Meter::ExactCode {
                code: tok.parse().unwrap_or(0),
                metric: format!("{}.code.{}", handler_name, tok),
            });
        } else if is_class_token(tok) {
            debug!(handler = handler_name, code = tok, "creating status metric");
            let class = (tok.as_bytes()[0] - b'0') as u16 * 100;
            meters.push(Meter::ClassCode {
                class,
                metric: format!("{}.code.{}", handler_name, tok),
            });
        }
    }
    meters
}
