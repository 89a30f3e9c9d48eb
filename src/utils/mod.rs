pub mod process_img;
