pub mod xlinestore;
