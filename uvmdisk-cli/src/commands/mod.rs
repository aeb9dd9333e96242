pub mod completion;
pub mod provision;
pub mod tar2vhd;
pub mod vhd2tar;
