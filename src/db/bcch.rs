pub mod series_archive;
