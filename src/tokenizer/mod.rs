pub mod vocab;

pub use vocab::CharVocab;
