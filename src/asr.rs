pub mod attention;
pub mod batch;
pub mod common;
pub mod ctc;
pub mod decoder;
pub mod encoder;
pub mod seq2seq;
pub mod vocab;
