//! Type grammar, primitive codec, scanner, converter, text parser and
//! printer for the self-describing `(T, V)` wire format (spec §2 items
//! 1–3, 4.1–4.6).
//!
//! Layered leaves-first: [`typestr`] and [`codec`] have no dependents
//! inside this crate; [`scan`] builds on both; [`convert`] builds on
//! [`scan`]; [`parser`] and [`printer`] are independent front/back ends
//! that share [`errval`] and [`codec`] with the rest.

pub mod codec;
pub mod convert;
pub mod errval;
pub mod parser;
pub mod printer;
pub mod scan;
pub mod typestr;

pub use codec::{AnyOwned, AnyView, Sink};
pub use convert::{check_convert, convert, ConvertError, UnplacedError};
pub use errval::ErrorRecord;
pub use parser::{parse_value, ParseError, ParseMode, ParsedValue};
pub use printer::{print_value, PrintMode, PrintOutcome};
pub use scan::{scan, ScanError, ScanErrorKind};
pub use typestr::{parse_type, parse_type_chunks, TypeProblem, TypeResult};

pub use anyser_base::{ConvertPolicy, ErrorKind};
