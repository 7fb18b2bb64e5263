//! End-to-end exercises of the publisher → broker → subscriber path.

mod end_to_end;
mod support;
