pub mod ordfloat;
pub mod pmap;
