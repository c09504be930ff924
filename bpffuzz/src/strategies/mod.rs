pub mod parse_verifier;
