pub mod rnn;
pub mod tensor_ext;
