pub mod face_recognition;
