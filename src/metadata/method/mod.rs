//! Method bodies and their exception handling regions.

mod body;
mod exceptions;

pub use body::MethodBody;
pub use exceptions::{
    encode_exception_section, parse_exception_sections, ExceptionClause, ExceptionHandler,
    ExceptionHandlerFlags, SectionFlags,
};
