pub mod hmx;
